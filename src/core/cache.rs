//! Read-through response cache over a [`CacheStore`].
//!
//! The cache is an optimization, never a dependency: every store error is
//! logged and degrades to a miss (or a no-op for writes) instead of failing
//! the caller's request.
use std::{convert::Infallible, future::Future, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    config::CacheConfig,
    metrics::{add_invalidated_keys, record_cache_lookup},
    ports::cache_store::CacheStore,
};

/// JSON-encoding, key-prefixing wrapper around a cache store. Cheap to clone.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    prefix: String,
    default_ttl: Duration,
    scan_batch_size: usize,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            scan_batch_size: config.scan_batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Fetch and decode a value; store errors and undecodable payloads are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(&self.full_key(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("Failed to get cache for key {}: {}", key, e);
                None
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str::<Option<T>>(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        });
        record_cache_lookup(value.is_some());
        value
    }

    /// Store a value; `ttl` of `None` uses the configured default.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize cache value for key {}: {}", key, e);
                return;
            }
        };

        let ttl = ttl.unwrap_or(self.default_ttl);
        if let Err(e) = self.store.set(&self.full_key(key), &payload, ttl).await {
            tracing::error!("Failed to set cache for key {}: {}", key, e);
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(&self.full_key(key)).await {
            tracing::error!("Failed to delete cache for key {}: {}", key, e);
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.store.get(&self.full_key(key)).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                tracing::error!("Failed to check cache existence for key {}: {}", key, e);
                false
            }
        }
    }

    /// Return the cached value, or run `producer`, cache a present result and return it.
    ///
    /// A `None` from the producer is returned but not cached.
    pub async fn remember<T, F, Fut>(&self, key: &str, ttl: Option<Duration>, producer: F) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let result = self
            .try_remember(key, ttl, || async { Ok::<_, Infallible>(producer().await) })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`remember`](Self::remember); a producer error is
    /// returned unchanged and nothing is cached.
    pub async fn try_remember<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(Some(cached));
        }

        let value = producer().await?;
        if let Some(value) = &value {
            self.set(key, value, ttl).await;
        }
        Ok(value)
    }

    /// Delete every key matching the glob `pattern` (prefix applied), paging
    /// through the store with a scan cursor. Returns the number of keys removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let full_pattern = self.full_key(pattern);
        let mut cursor = 0;
        let mut deleted = 0;

        loop {
            let page = match self
                .store
                .scan(cursor, &full_pattern, self.scan_batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!("Failed to invalidate cache pattern {}: {}", pattern, e);
                    break;
                }
            };

            if !page.keys.is_empty() {
                match self.store.delete_many(&page.keys).await {
                    Ok(count) => deleted += count,
                    Err(e) => {
                        tracing::error!("Failed to invalidate cache pattern {}: {}", pattern, e);
                        break;
                    }
                }
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        if deleted > 0 {
            tracing::info!(
                "Invalidated {} cache keys matching pattern: {}",
                deleted,
                pattern
            );
            add_invalidated_keys(deleted);
        }
        deleted
    }
}
