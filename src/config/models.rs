//! Configuration data structures for Waypoint.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! Builders and enums here are considered part of the public API for embedding.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_interval_secs() -> u64 {
    30
}

/// A backend service known to the registry at startup.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Logical service name (e.g. `user-service`)
    pub name: String,
    /// Base URL requests are forwarded to
    pub url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_interval_secs")]
    pub health_check_interval_secs: u64,
    /// API versions this service serves through `/api/{name}`; empty serves all
    #[serde(default)]
    pub versions: Vec<String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            health_path: default_health_path(),
            health_check_interval_secs: default_interval_secs(),
            versions: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Run periodic background probes
    pub enabled: bool,
    pub timeout_secs: u64,
    pub default_interval_secs: u64,
    /// TTL of memoized service addresses in the cache store
    pub address_cache_ttl_secs: u64,
}

impl HealthCheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn address_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.address_cache_ttl_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 5,
            default_interval_secs: 30,
            address_cache_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive network failures before the circuit opens
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a trial call
    pub reset_timeout_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ProxyConfig {
    pub default_timeout_ms: u64,
}

impl ProxyConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

/// Where the caller's requested API version is read from.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersioningType {
    /// `/v2/...` path segment
    Uri,
    /// Dedicated request header
    Header,
    /// Query string parameter
    Query,
    /// Vendor media type in `Accept`
    MediaType,
}

impl std::fmt::Display for VersioningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersioningType::Uri => write!(f, "uri"),
            VersioningType::Header => write!(f, "header"),
            VersioningType::Query => write!(f, "query"),
            VersioningType::MediaType => write!(f, "media_type"),
        }
    }
}

/// A deprecated API version and what callers should be told about it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeprecationPolicy {
    pub version: String,
    #[serde(default)]
    pub deprecated_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub removal_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub migration_guide: Option<String>,
}

impl DeprecationPolicy {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            deprecated_since: None,
            removal_date: None,
            migration_guide: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VersioningConfig {
    /// Extraction strategies in priority order
    pub strategies: Vec<VersioningType>,
    pub header: String,
    pub query: String,
    pub prefix: String,
    /// `<product>` in `application/vnd.<product>.v2+json`
    pub media_type_product: String,
    pub default_version: String,
    pub supported_versions: Vec<String>,
    pub deprecated: Vec<DeprecationPolicy>,
    pub fallback_to_default: bool,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                VersioningType::Uri,
                VersioningType::Header,
                VersioningType::Query,
                VersioningType::MediaType,
            ],
            header: "X-API-Version".to_string(),
            query: "version".to_string(),
            prefix: "v".to_string(),
            media_type_product: "waypoint".to_string(),
            default_version: "1".to_string(),
            supported_versions: Vec::new(),
            deprecated: Vec::new(),
            fallback_to_default: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub store: CacheBackend,
    pub redis_url: Option<String>,
    pub default_ttl_secs: u64,
    pub key_prefix: String,
    pub scan_batch_size: usize,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store: CacheBackend::Memory,
            redis_url: None,
            default_ttl_secs: 300,
            key_prefix: "cache:".to_string(),
            scan_batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub versioning: VersioningConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            services: Vec::new(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            proxy: ProxyConfig::default(),
            versioning: VersioningConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct GatewayConfigBuilder {
    listen_addr: Option<String>,
    services: Vec<ServiceConfig>,
    health_check: Option<HealthCheckConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    proxy: Option<ProxyConfig>,
    versioning: Option<VersioningConfig>,
    cache: Option<CacheConfig>,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Add a backend service with default probing settings
    pub fn service(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.services.push(ServiceConfig::new(name, url));
        self
    }

    /// Add a fully specified backend service
    pub fn service_config(mut self, service: ServiceConfig) -> Self {
        self.services.push(service);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn proxy(mut self, config: ProxyConfig) -> Self {
        self.proxy = Some(config);
        self
    }

    pub fn versioning(mut self, config: VersioningConfig) -> Self {
        self.versioning = Some(config);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        Ok(GatewayConfig {
            listen_addr,
            services: self.services,
            health_check: self.health_check.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            proxy: self.proxy.unwrap_or_default(),
            versioning: self.versioning.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            logging: LoggingConfig::default(),
        })
    }
}
