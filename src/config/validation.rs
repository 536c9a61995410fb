#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use http::HeaderName;

use crate::{
    config::models::{
        CacheBackend, CacheConfig, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig,
        ServiceConfig, VersioningConfig,
    },
    core::{backend::BackendUrl, versioning},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Duplicate service name: {name}")]
    DuplicateService { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem found
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        let mut seen = HashSet::new();
        for service in &config.services {
            if !seen.insert(service.name.as_str()) {
                errors.push(ValidationError::DuplicateService {
                    name: service.name.clone(),
                });
            }
            errors.extend(Self::validate_service(service));
            errors.extend(Self::validate_service_versions(
                service,
                &config.versioning.prefix,
            ));
        }

        errors.extend(Self::validate_health_check_config(&config.health_check));
        errors.extend(Self::validate_circuit_breaker_config(&config.circuit_breaker));

        if config.proxy.default_timeout_ms == 0 {
            errors.push(ValidationError::InvalidField {
                field: "proxy.default_timeout_ms".to_string(),
                message: "Forwarding timeout must be greater than 0".to_string(),
            });
        }

        errors.extend(Self::validate_versioning_config(&config.versioning));
        errors.extend(Self::validate_cache_config(&config.cache));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_service(service: &ServiceConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if service.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services[].name".to_string(),
            });
        }

        if let Err(e) = BackendUrl::new(&service.url) {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{}' url", service.name),
                message: e.to_string(),
            });
        }

        if !service.health_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("service '{}' health_path", service.name),
                message: "Health probe paths must start with '/'".to_string(),
            });
        }

        errors
    }

    fn validate_service_versions(service: &ServiceConfig, prefix: &str) -> Vec<ValidationError> {
        service
            .versions
            .iter()
            .filter(|version| versioning::normalize_version(version, prefix).is_err())
            .map(|version| ValidationError::InvalidField {
                field: format!("service '{}' versions", service.name),
                message: format!("'{version}' is not a valid version"),
            })
            .collect()
    }

    fn validate_health_check_config(config: &HealthCheckConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.timeout_secs".to_string(),
                message: "Health check timeout must be greater than 0".to_string(),
            });
        }

        if config.enabled && config.default_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.default_interval_secs".to_string(),
                message: "Health check interval must be greater than 0".to_string(),
            });
        }

        errors
    }

    fn validate_circuit_breaker_config(config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.failure_threshold".to_string(),
                message: "Failure threshold must be at least 1".to_string(),
            });
        }

        if config.reset_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.reset_timeout_secs".to_string(),
                message: "Reset timeout must be greater than 0".to_string(),
            });
        }

        errors
    }

    fn validate_versioning_config(config: &VersioningConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.strategies.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "versioning.strategies".to_string(),
            });
        }

        if HeaderName::from_bytes(config.header.as_bytes()).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "versioning.header".to_string(),
                message: format!("'{}' is not a valid header name", config.header),
            });
        }

        if config.query.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "versioning.query".to_string(),
            });
        }

        let check = |field: String, version: &str, errors: &mut Vec<ValidationError>| {
            if versioning::normalize_version(version, &config.prefix).is_err() {
                errors.push(ValidationError::InvalidField {
                    field,
                    message: format!("'{version}' is not a valid version"),
                });
            }
        };

        check(
            "versioning.default_version".to_string(),
            &config.default_version,
            &mut errors,
        );
        for version in &config.supported_versions {
            check(
                "versioning.supported_versions".to_string(),
                version,
                &mut errors,
            );
        }
        for policy in &config.deprecated {
            check(
                "versioning.deprecated[].version".to_string(),
                &policy.version,
                &mut errors,
            );
            if let (Some(since), Some(removal)) = (policy.deprecated_since, policy.removal_date) {
                if removal < since {
                    errors.push(ValidationError::InvalidField {
                        field: format!("versioning.deprecated '{}'", policy.version),
                        message: "removal_date must not precede deprecated_since".to_string(),
                    });
                }
            }
        }

        errors
    }

    fn validate_cache_config(config: &CacheConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.store == CacheBackend::Redis {
            match &config.redis_url {
                None => errors.push(ValidationError::MissingField {
                    field: "cache.redis_url".to_string(),
                }),
                Some(url) => {
                    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                        errors.push(ValidationError::InvalidField {
                            field: "cache.redis_url".to_string(),
                            message: "Redis URL must start with redis:// or rediss://"
                                .to_string(),
                        });
                    }
                }
            }
        }

        if config.scan_batch_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.scan_batch_size".to_string(),
                message: "Scan batch size must be greater than 0".to_string(),
            });
        }

        errors
    }

    /// Format multiple errors into a single error message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
