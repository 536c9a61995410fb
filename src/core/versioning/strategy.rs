//! Version extraction strategies.
use http::{HeaderMap, HeaderName, Uri, header::ACCEPT};
use regex::Regex;

use super::{VersionError, path_version_regex};
use crate::config::{VersioningConfig, VersioningType};

/// One way of reading the requested version off a request.
#[derive(Debug, Clone)]
pub enum VersionStrategy {
    /// `/v2/...` anywhere in the path
    Uri { pattern: Regex },
    /// A dedicated header, `X-API-Version: 2` by default
    Header { name: HeaderName },
    /// `?version=2`
    Query { key: String },
    /// `Accept: application/vnd.<product>.v2+json`
    MediaType { pattern: Regex },
}

impl VersionStrategy {
    pub fn from_config(kind: VersioningType, config: &VersioningConfig) -> Result<Self, VersionError> {
        let strategy = match kind {
            VersioningType::Uri => VersionStrategy::Uri {
                pattern: path_version_regex(&config.prefix)
                    .map_err(|e| VersionError::InvalidConfiguration(e.to_string()))?,
            },
            VersioningType::Header => VersionStrategy::Header {
                name: HeaderName::from_bytes(config.header.as_bytes()).map_err(|_| {
                    VersionError::InvalidConfiguration(format!(
                        "'{}' is not a valid header name",
                        config.header
                    ))
                })?,
            },
            VersioningType::Query => VersionStrategy::Query {
                key: config.query.clone(),
            },
            VersioningType::MediaType => VersionStrategy::MediaType {
                pattern: Regex::new(&format!(
                    r"application/vnd\.{}\.v(\d+(?:\.\d+)?)\+json",
                    regex::escape(&config.media_type_product)
                ))
                .map_err(|e| VersionError::InvalidConfiguration(e.to_string()))?,
            },
        };
        Ok(strategy)
    }

    pub fn kind(&self) -> VersioningType {
        match self {
            VersionStrategy::Uri { .. } => VersioningType::Uri,
            VersionStrategy::Header { .. } => VersioningType::Header,
            VersionStrategy::Query { .. } => VersioningType::Query,
            VersionStrategy::MediaType { .. } => VersioningType::MediaType,
        }
    }

    /// The raw (unvalidated) version this strategy finds, if any.
    pub fn extract(&self, uri: &Uri, headers: &HeaderMap) -> Option<String> {
        let found = match self {
            VersionStrategy::Uri { pattern } => pattern
                .captures(uri.path())
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
            VersionStrategy::Header { name } => headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string()),
            VersionStrategy::Query { key } => uri.query().and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(k, _)| k == key.as_str())
                    .map(|(_, v)| v.trim().to_string())
            }),
            VersionStrategy::MediaType { pattern } => headers
                .get_all(ACCEPT)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(|value| {
                    pattern
                        .captures(value)
                        .and_then(|caps| caps.get(1))
                        .map(|m| m.as_str().to_string())
                }),
        };
        found.filter(|version| !version.is_empty())
    }
}
