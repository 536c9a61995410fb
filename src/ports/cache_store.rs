use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a cache store backend
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// Failed to connect to the backend
    #[error("Cache connection error: {0}")]
    ConnectionError(String),

    /// Generic backend failure
    #[error("Cache backend error: {0}")]
    BackendError(String),
}

/// Result type for cache store operations
pub type CacheResult<T> = Result<T, CacheError>;

/// One page of a cursor-based key scan.
///
/// A `cursor` of `0` means the iteration is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// CacheStore defines the port for a keyed, TTL-capable store
///
/// Semantics follow Redis: `scan` starts at cursor `0` and is repeated with the
/// returned cursor until it comes back as `0`. `pattern` is a glob (`*`, `?`).
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Fetch a raw value, `None` on miss or expiry
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a raw value with a time to live
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Delete a single key (missing keys are not an error)
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete a batch of keys, returning how many existed
    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64>;

    /// Return the next page of keys matching `pattern`
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> CacheResult<ScanPage>;

    /// Check that the backend is reachable
    async fn ping(&self) -> CacheResult<bool>;

    /// Short provider name used in logs
    fn provider_name(&self) -> &'static str;
}
