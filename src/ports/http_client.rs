use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The backend actively refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// No connection could be established (DNS lookup or TCP connect failed)
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// Any other network-layer failure (reset, TLS, protocol)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpClientError {
    /// Whether the error means the backend could not be reached at all.
    ///
    /// Only these failures count against a circuit breaker; a malformed
    /// request never left the gateway.
    pub fn is_network_failure(&self) -> bool {
        !matches!(self, HttpClientError::InvalidRequest(_))
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a fully buffered HTTP request to a backend server
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send to the backend
    /// * `timeout` - Upper bound for the whole exchange, body included
    ///
    /// # Returns
    /// The backend's response for any status code, or a transport error
    async fn send_request(
        &self,
        req: Request<Bytes>,
        timeout: Duration,
    ) -> HttpClientResult<Response<Bytes>>;

    /// Perform a health probe (GET) against a backend
    ///
    /// # Arguments
    /// * `url` - The URL to check
    /// * `timeout` - Probe timeout
    ///
    /// # Returns
    /// The status code the backend answered with
    async fn health_check(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode>;
}
