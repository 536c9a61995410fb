//! Waypoint - an API gateway for a fleet of HTTP backend services.
//!
//! Waypoint sits between clients and a set of logically named backends. Every inbound
//! request goes through the same pipeline:
//!
//! 1. the [`VersionNegotiator`](core::VersionNegotiator) resolves an API version from the
//!    URI, a header, a query parameter or the `Accept` media type;
//! 2. reads consult the [`ResponseCache`](core::ResponseCache);
//! 3. on a miss the [`ServiceRegistry`](core::ServiceRegistry) resolves a healthy base URL
//!    for the service;
//! 4. the [`Forwarder`](core::Forwarder) performs the call behind a per-service circuit
//!    breaker;
//! 5. writes invalidate the cached reads of the service.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use waypoint::{
//!     HttpClientAdapter,
//!     adapters::MemoryCacheStore,
//!     config::{CacheConfig, HealthCheckConfig, ProxyConfig, ServiceConfig, CircuitBreakerConfig},
//!     core::{CircuitBreakerRegistry, Forwarder, ResponseCache, ServiceRegistry},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let client = Arc::new(HttpClientAdapter::new()?);
//! let cache = ResponseCache::new(Arc::new(MemoryCacheStore::new()), &CacheConfig::default());
//! let registry = Arc::new(ServiceRegistry::new(client.clone(), cache, HealthCheckConfig::default()));
//! registry
//!     .register_service(ServiceConfig::new("user-service", "http://localhost:3001"))
//!     .await?;
//!
//! let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
//! let forwarder = Forwarder::new(registry, breakers, client, &ProxyConfig::default());
//! let body = forwarder.get("user-service", "/users/42").await?;
//! # let _ = body;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the gateway logic inside `core`. The HTTP client and the cache store are both ports, so
//! the core is tested against in-memory doubles.
//!
//! # Error Handling
//! Each layer has its own `thiserror` enum. Registry and transport failures are folded into
//! [`DispatchError`](core::DispatchError) before they reach a handler, so handlers only
//! distinguish "service down", "rejected by the service" and "internal".
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; circuit breakers are lock-free atomics.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler, MemoryCacheStore, RedisCacheStore},
    core::{Forwarder, ResponseCache, ServiceRegistry, VersionNegotiator},
    ports::{cache_store::CacheStore, http_client::HttpClient},
};
