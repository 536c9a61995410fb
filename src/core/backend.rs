use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

/// Errors related to backend operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of a backend base URL
///
/// Always `http://` or `https://`, with any trailing slash removed so that
/// request paths (which start with `/`) can be appended directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: String,
    is_secure: bool,
}

impl BackendUrl {
    /// Creates a new BackendUrl if the provided string is a valid URL
    pub fn new(url: &str) -> BackendResult<Self> {
        let is_secure = url.starts_with("https://");
        let is_http = url.starts_with("http://");

        if !is_secure && !is_http {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        let parsed =
            Url::parse(url).map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL has no host: {url}"
            )));
        }

        Ok(BackendUrl {
            url: url.trim_end_matches('/').to_string(),
            is_secure,
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Append a path (expected to start with `/`) to the base URL
    pub fn join(&self, path: &str) -> String {
        if path.is_empty() || path.starts_with('/') {
            format!("{}{path}", self.url)
        } else {
            format!("{}/{path}", self.url)
        }
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl Serialize for BackendUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.url)
    }
}

impl<'de> Deserialize<'de> for BackendUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BackendUrl::new(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_url_valid() {
        let url = "http://example.com";
        let backend_url = BackendUrl::new(url).expect("Valid HTTP URL should parse");
        assert_eq!(backend_url.as_str(), url);
        assert!(!backend_url.is_secure());

        let secure_url = "https://secure.example.com:8443";
        let secure_backend_url = BackendUrl::new(secure_url).expect("Valid HTTPS URL should parse");
        assert_eq!(secure_backend_url.as_str(), secure_url);
        assert!(secure_backend_url.is_secure());
    }

    #[test]
    fn test_backend_url_invalid() {
        assert!(BackendUrl::new("example.com").is_err());
        assert!(BackendUrl::new("ftp://example.com").is_err());
        assert!(BackendUrl::new("http://").is_err());
    }

    #[test]
    fn test_backend_url_strips_trailing_slash() {
        let backend_url: BackendUrl = "http://localhost:3001/".parse().unwrap();
        assert_eq!(backend_url.as_str(), "http://localhost:3001");
        assert_eq!(backend_url.join("/users/1"), "http://localhost:3001/users/1");
        assert_eq!(backend_url.join("health"), "http://localhost:3001/health");
    }

    #[test]
    fn test_backend_url_serde_round_trip_validates() {
        let parsed: Result<BackendUrl, _> = serde_json::from_str("\"not a url\"");
        assert!(parsed.is_err());

        let parsed: BackendUrl = serde_json::from_str("\"http://localhost:3002\"").unwrap();
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            "\"http://localhost:3002\""
        );
    }
}
