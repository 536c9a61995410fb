pub mod backend;
pub mod cache;
pub mod circuit_breaker;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod registry;
pub mod versioning;

pub use cache::ResponseCache;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use error::DispatchError;
pub use forwarder::{ForwardRequest, Forwarder};
pub use health::{HealthCheckResult, HealthStatus};
pub use registry::{RegistryError, ServiceDescriptor, ServiceRegistry};
pub use versioning::{VersionContext, VersionError, VersionNegotiator, VersionRequirement};
