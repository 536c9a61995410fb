//! Per-request version negotiation and response decoration.
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Uri, header::LINK};
use serde::Serialize;

use super::{
    VersionError, deprecation_policy, generate_deprecation_message, normalize_version,
    select_best_version, strategy::VersionStrategy,
};
use crate::config::{VersioningConfig, VersioningType};

pub const DEPRECATION: HeaderName = HeaderName::from_static("deprecation");
pub const SUNSET: HeaderName = HeaderName::from_static("sunset");
pub const X_API_VERSION: HeaderName = HeaderName::from_static("x-api-version");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprecationInfo {
    pub deprecated_since: Option<DateTime<Utc>>,
    pub removal_date: Option<DateTime<Utc>>,
    pub migration_guide: Option<String>,
    /// Human-readable notice sent in the `Deprecation` header
    pub message: String,
}

/// Outcome of negotiation, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionContext {
    /// Raw value as extracted, before validation
    pub requested_version: Option<String>,
    pub resolved_version: String,
    /// `None` when no strategy matched and the default was used
    pub strategy_used: Option<VersioningType>,
    pub is_deprecated: bool,
    pub deprecation_info: Option<DeprecationInfo>,
}

impl VersionContext {
    pub fn version(&self) -> &str {
        &self.resolved_version
    }

    pub fn is_default(&self) -> bool {
        self.strategy_used.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct VersionNegotiator {
    strategies: Vec<VersionStrategy>,
    default_version: String,
    config: VersioningConfig,
}

impl VersionNegotiator {
    pub fn new(config: VersioningConfig) -> Result<Self, VersionError> {
        let strategies = config
            .strategies
            .iter()
            .map(|kind| VersionStrategy::from_config(*kind, &config))
            .collect::<Result<Vec<_>, _>>()?;

        let default_version = normalize_version(&config.default_version, &config.prefix)
            .map_err(|_| {
                VersionError::InvalidConfiguration(format!(
                    "default version '{}' is not a valid version",
                    config.default_version
                ))
            })?;

        Ok(Self {
            strategies,
            default_version,
            config,
        })
    }

    pub fn config(&self) -> &VersioningConfig {
        &self.config
    }

    pub fn default_version(&self) -> &str {
        &self.default_version
    }

    pub fn negotiate_request<B>(&self, request: &Request<B>) -> Result<VersionContext, VersionError> {
        self.negotiate(request.uri(), request.headers())
    }

    /// Try each strategy in configured order; the first non-empty value wins.
    pub fn negotiate(&self, uri: &Uri, headers: &HeaderMap) -> Result<VersionContext, VersionError> {
        let extracted = self.strategies.iter().find_map(|strategy| {
            strategy
                .extract(uri, headers)
                .map(|version| (version, strategy.kind()))
        });

        let (requested_version, strategy_used) = match extracted {
            Some((version, kind)) => (Some(version), Some(kind)),
            None if self.config.fallback_to_default => (None, None),
            None => return Err(VersionError::VersionRequired),
        };

        let resolved_version = self.resolve(requested_version.as_deref());
        let deprecation_info = self.deprecation_info(&resolved_version);

        Ok(VersionContext {
            requested_version,
            resolved_version,
            strategy_used,
            is_deprecated: deprecation_info.is_some(),
            deprecation_info,
        })
    }

    fn resolve(&self, requested: Option<&str>) -> String {
        let Some(requested) = requested else {
            return self.default_version.clone();
        };

        let normalized = match normalize_version(requested, &self.config.prefix) {
            Ok(version) => version,
            Err(_) => {
                tracing::debug!(
                    "Ignoring malformed API version '{}', using default {}",
                    requested,
                    self.default_version
                );
                return self.default_version.clone();
            }
        };

        if self.config.supported_versions.is_empty() {
            normalized
        } else {
            select_best_version(
                Some(&normalized),
                &self.config.supported_versions,
                &self.default_version,
                &self.config.prefix,
            )
        }
    }

    pub fn deprecation_info(&self, version: &str) -> Option<DeprecationInfo> {
        let policy = deprecation_policy(version, &self.config.deprecated, &self.config.prefix)?;
        Some(DeprecationInfo {
            deprecated_since: policy.deprecated_since,
            removal_date: policy.removal_date,
            migration_guide: policy.migration_guide.clone(),
            message: generate_deprecation_message(
                version,
                policy.deprecated_since.as_ref(),
                policy.removal_date.as_ref(),
                policy.migration_guide.as_deref(),
            ),
        })
    }
}

/// Echo the resolved version and, for deprecated versions, add
/// `Deprecation`, `Sunset` and `Link` headers.
pub fn apply_version_headers(headers: &mut HeaderMap, context: &VersionContext) {
    if let Ok(value) = HeaderValue::from_str(&context.resolved_version) {
        headers.insert(X_API_VERSION, value);
    }

    let Some(info) = &context.deprecation_info else {
        return;
    };

    if let Ok(value) = HeaderValue::from_str(&info.message) {
        headers.insert(DEPRECATION, value);
    }
    if let Some(removal) = &info.removal_date {
        let http_date = removal.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&http_date) {
            headers.insert(SUNSET, value);
        }
    }
    if let Some(guide) = &info.migration_guide {
        if let Ok(value) = HeaderValue::from_str(&format!("<{guide}>; rel=\"deprecation\"")) {
            headers.insert(LINK, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::DeprecationPolicy;

    fn negotiator(config: VersioningConfig) -> VersionNegotiator {
        VersionNegotiator::new(config).unwrap()
    }

    fn request(uri: &str, headers: &[(&'static str, &'static str)]) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_uri_before_header_wins() {
        let n = negotiator(VersioningConfig::default());
        let ctx = n
            .negotiate_request(&request("/v2/users", &[("X-API-Version", "3")]))
            .unwrap();
        assert_eq!(ctx.version(), "2");
        assert_eq!(ctx.strategy_used, Some(VersioningType::Uri));
        assert_eq!(ctx.requested_version.as_deref(), Some("2"));
    }

    #[test]
    fn test_configured_order_is_respected() {
        let n = negotiator(VersioningConfig {
            strategies: vec![VersioningType::Header, VersioningType::Uri],
            ..VersioningConfig::default()
        });
        let ctx = n
            .negotiate_request(&request("/v2/users", &[("X-API-Version", "3")]))
            .unwrap();
        assert_eq!(ctx.version(), "3");
        assert_eq!(ctx.strategy_used, Some(VersioningType::Header));
    }

    #[test]
    fn test_default_used_when_nothing_matches() {
        let n = negotiator(VersioningConfig::default());
        let ctx = n.negotiate_request(&request("/users", &[])).unwrap();
        assert_eq!(ctx.version(), "1");
        assert!(ctx.is_default());
        assert!(ctx.requested_version.is_none());
    }

    #[test]
    fn test_version_required_without_fallback() {
        let n = negotiator(VersioningConfig {
            fallback_to_default: false,
            ..VersioningConfig::default()
        });
        assert_eq!(
            n.negotiate_request(&request("/users", &[])),
            Err(VersionError::VersionRequired)
        );
    }

    #[test]
    fn test_malformed_version_falls_back_to_default() {
        let n = negotiator(VersioningConfig {
            default_version: "v2".into(),
            ..VersioningConfig::default()
        });
        let ctx = n
            .negotiate_request(&request("/users", &[("X-API-Version", "latest")]))
            .unwrap();
        assert_eq!(ctx.version(), "2");
        assert_eq!(ctx.requested_version.as_deref(), Some("latest"));
    }

    #[test]
    fn test_supported_list_rounds_down() {
        let n = negotiator(VersioningConfig {
            default_version: "3".into(),
            supported_versions: vec!["1".into(), "2".into(), "3".into()],
            ..VersioningConfig::default()
        });
        let resolve = |query: &str| {
            n.negotiate_request(&request(&format!("/users?version={query}"), &[]))
                .unwrap()
                .resolved_version
        };
        assert_eq!(resolve("2.5"), "2");
        assert_eq!(resolve("v1"), "1");
        assert_eq!(resolve("0.5"), "3");
    }

    #[test]
    fn test_deprecated_version_is_flagged_and_decorated() {
        let removal = Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap();
        let n = negotiator(VersioningConfig {
            deprecated: vec![DeprecationPolicy {
                version: "v1".into(),
                deprecated_since: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
                removal_date: Some(removal),
                migration_guide: Some("https://docs.example.com/v2".into()),
            }],
            ..VersioningConfig::default()
        });

        let ctx = n.negotiate_request(&request("/v1/aquariums", &[])).unwrap();
        assert!(ctx.is_deprecated);
        let info = ctx.deprecation_info.as_ref().unwrap();
        assert!(info.message.starts_with("API version 1 is deprecated since 2025-01-01"));

        let mut headers = HeaderMap::new();
        apply_version_headers(&mut headers, &ctx);
        assert_eq!(headers[&X_API_VERSION], "1");
        assert_eq!(headers[&DEPRECATION], info.message.as_str());
        assert_eq!(headers[&SUNSET], "Mon, 30 Jun 2025 00:00:00 GMT");
        assert_eq!(headers[LINK], "<https://docs.example.com/v2>; rel=\"deprecation\"");

        let current = n.negotiate_request(&request("/v2/aquariums", &[])).unwrap();
        let mut headers = HeaderMap::new();
        apply_version_headers(&mut headers, &current);
        assert_eq!(headers[&X_API_VERSION], "2");
        assert!(!headers.contains_key(&DEPRECATION));
    }

    #[test]
    fn test_invalid_default_version_is_rejected() {
        let result = VersionNegotiator::new(VersioningConfig {
            default_version: "latest".into(),
            ..VersioningConfig::default()
        });
        assert!(matches!(result, Err(VersionError::InvalidConfiguration(_))));
    }
}
