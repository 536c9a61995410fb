//! In-process cache store with per-entry TTL.
//!
//! Keys live in an ordered map so that scan cursors can resume after the last
//! key they handed out. Deleting keys between pages (which is exactly what
//! pattern invalidation does) therefore never causes keys to be skipped.
//! State is local to the process; use the Redis store when several gateway
//! instances must share invalidations.
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use regex::Regex;

use crate::ports::cache_store::{CacheError, CacheResult, CacheStore, ScanPage};

const DEFAULT_SCAN_COUNT: usize = 10;
/// Expired entries are swept from the map once every this many writes.
const SWEEP_EVERY_WRITES: u64 = 256;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    /// Open scan cursors, mapped to the last key they examined
    cursors: Mutex<HashMap<u64, String>>,
    next_cursor: AtomicU64,
    writes: AtomicU64,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            next_cursor: AtomicU64::new(1),
            ..Default::default()
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<u64, String>> {
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Keys that are written once and never read
    /// again would otherwise stay in the map forever.
    fn sweep_expired(entries: &mut BTreeMap<String, Entry>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!("Swept {} expired cache entries", swept);
        }
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.entries().len()
    }

    fn allocate_cursor(&self, last_key: String) -> u64 {
        let mut id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors().insert(id, last_key);
        id
    }
}

/// Compile a Redis-style glob (`*`, `?`, `\` escapes) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    expr.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4])));
                }
            }
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let mut entries = self.entries();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            Self::sweep_expired(&mut entries, now);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries();
        let mut deleted = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.is_live(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> CacheResult<ScanPage> {
        let matcher = glob_to_regex(pattern)
            .map_err(|e| CacheError::BackendError(format!("Invalid scan pattern '{pattern}': {e}")))?;
        let count = if count == 0 { DEFAULT_SCAN_COUNT } else { count };

        let resume_after = if cursor == 0 {
            None
        } else {
            match self.cursors().remove(&cursor) {
                Some(key) => Some(key),
                None => {
                    return Err(CacheError::BackendError(format!(
                        "Unknown scan cursor {cursor}"
                    )));
                }
            }
        };

        let now = Instant::now();
        let mut keys = Vec::new();
        let mut expired = Vec::new();
        let mut last_examined = None;
        let has_more;
        {
            let entries = self.entries();
            let lower = match &resume_after {
                Some(key) => Bound::Excluded(key.as_str()),
                None => Bound::Unbounded,
            };
            let mut range = entries.range::<str, _>((lower, Bound::Unbounded));

            for (key, entry) in range.by_ref().take(count) {
                if !entry.is_live(now) {
                    expired.push(key.clone());
                } else if matcher.is_match(key) {
                    keys.push(key.clone());
                }
                last_examined = Some(key.clone());
            }
            has_more = range.next().is_some();
        }

        if !expired.is_empty() {
            let mut entries = self.entries();
            for key in expired {
                entries.remove(&key);
            }
        }

        let next_cursor = match (has_more, last_examined) {
            (true, Some(last)) => self.allocate_cursor(last),
            _ => 0,
        };

        Ok(ScanPage {
            cursor: next_cursor,
            keys,
        })
    }

    async fn ping(&self) -> CacheResult<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("cache:user:*").unwrap();
        assert!(re.is_match("cache:user:1"));
        assert!(re.is_match("cache:user:"));
        assert!(!re.is_match("cache:users:1"));
        assert!(!re.is_match("xcache:user:1"));

        let re = glob_to_regex("item.?").unwrap();
        assert!(re.is_match("item.a"));
        assert!(!re.is_match("itemXa"));

        let re = glob_to_regex(r"literal\*").unwrap();
        assert!(re.is_match("literal*"));
        assert!(!re.is_match("literalX"));
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryCacheStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store
            .set("key", "value", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some("value".to_string()));

        store.delete("key").await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = MemoryCacheStore::new();
        store
            .set("short", "lived", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unread_expired_entries_are_swept_by_later_writes() {
        let store = MemoryCacheStore::new();
        for i in 0..1000 {
            store
                .set(&format!("once:{i}"), "x", Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(store.stored(), 1000);
        tokio::time::sleep(Duration::from_millis(30)).await;

        for _ in 0..SWEEP_EVERY_WRITES {
            store
                .set("hot", "x", Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(store.stored(), 1);
        assert_eq!(store.get("hot").await.unwrap(), Some("x".to_string()));
    }

    #[tokio::test]
    async fn test_scan_pages_until_cursor_returns_to_zero() {
        let store = MemoryCacheStore::new();
        for i in 0..25 {
            store
                .set(&format!("user:{i:02}"), "x", Duration::from_secs(60))
                .await
                .unwrap();
            store
                .set(&format!("order:{i:02}"), "x", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = store.scan(cursor, "user:*", 10).await.unwrap();
            seen.extend(page.keys);
            pages += 1;
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        assert_eq!(pages, 5);
        assert_eq!(seen.len(), 25);
        assert!(seen.iter().all(|k| k.starts_with("user:")));
    }

    #[tokio::test]
    async fn test_scan_survives_deletes_between_pages() {
        let store = MemoryCacheStore::new();
        for i in 0..30 {
            store
                .set(&format!("k:{i:02}"), "x", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let page = store.scan(cursor, "k:*", 7).await.unwrap();
            deleted += store.delete_many(&page.keys).await.unwrap();
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        assert_eq!(deleted, 30);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_cursor_is_an_error() {
        let store = MemoryCacheStore::new();
        assert!(store.scan(4242, "*", 10).await.is_err());
    }
}
