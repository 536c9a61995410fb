//! Ports: the traits the dispatch core talks to. Adapters implement them.
pub mod cache_store;
pub mod http_client;

pub use cache_store::{CacheError, CacheResult, CacheStore, ScanPage};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
