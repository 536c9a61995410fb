//! API version negotiation.
//!
//! Versions are bare integers (`2`) or dotted numbers (`2.1`, `2.1.3`),
//! optionally carrying a prefix (`v2`) that is stripped before comparison.
//! Missing components compare as zero, so `2` == `2.0` in ordering terms
//! (but not for exact allow-list matches, which compare strings).
pub mod negotiator;
pub mod requirement;
pub mod strategy;

use std::cmp::Ordering;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use http::StatusCode;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use thiserror::Error;

pub use negotiator::{DeprecationInfo, VersionContext, VersionNegotiator, apply_version_headers};
pub use requirement::VersionRequirement;
pub use strategy::VersionStrategy;

use crate::config::DeprecationPolicy;

static VERSION_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+){0,2}$").expect("valid regex"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("API version is required for this endpoint")]
    VersionRequired,

    #[error("API version {version} is not supported. Supported versions: {}", supported.join(", "))]
    Unsupported {
        version: String,
        supported: Vec<String>,
    },

    #[error("Invalid versioning configuration: {0}")]
    InvalidConfiguration(String),
}

impl IntoResponse for VersionError {
    fn into_response(self) -> Response {
        let status = match self {
            VersionError::InvalidConfiguration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let mut body = json!({
            "statusCode": status.as_u16(),
            "message": self.to_string(),
        });
        if let VersionError::Unsupported { supported, .. } = &self {
            body["supportedVersions"] = json!(supported);
        }
        (status, Json(body)).into_response()
    }
}

pub fn is_valid_version(version: &str) -> bool {
    VERSION_FORMAT.is_match(version)
}

/// Strip `prefix` and validate: `v1` -> `1`, `2.1` -> `2.1`, `beta` -> error.
pub fn normalize_version(version: &str, prefix: &str) -> Result<String, VersionError> {
    let trimmed = version.trim();
    let bare = if prefix.is_empty() {
        trimmed
    } else {
        trimmed.strip_prefix(prefix).unwrap_or(trimmed)
    };

    if is_valid_version(bare) {
        Ok(bare.to_string())
    } else {
        Err(VersionError::InvalidVersion(version.to_string()))
    }
}

fn components(version: &str) -> [u64; 3] {
    let mut parts = [0; 3];
    for (slot, part) in parts.iter_mut().zip(version.split('.')) {
        *slot = part.parse().unwrap_or(0);
    }
    parts
}

/// Numeric ordering of two normalized versions.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    components(a).cmp(&components(b))
}

/// Pick the version to serve for `requested`.
///
/// Exact (normalized) match first, then the highest supported version not
/// above the request, else `default`. An absent or malformed request also
/// yields `default`.
pub fn select_best_version(
    requested: Option<&str>,
    supported: &[String],
    default: &str,
    prefix: &str,
) -> String {
    let Some(requested) = requested.filter(|r| !r.trim().is_empty()) else {
        return default.to_string();
    };
    let Ok(requested) = normalize_version(requested, prefix) else {
        return default.to_string();
    };

    let mut candidates: Vec<String> = supported
        .iter()
        .filter_map(|v| normalize_version(v, prefix).ok())
        .collect();

    if candidates.iter().any(|v| *v == requested) {
        return requested;
    }

    candidates.sort_by(|a, b| compare_versions(b, a));
    candidates
        .into_iter()
        .find(|v| compare_versions(v, &requested) != Ordering::Greater)
        .unwrap_or_else(|| default.to_string())
}

pub fn is_version_supported(version: &str, supported: &[String], prefix: &str) -> bool {
    let Ok(version) = normalize_version(version, prefix) else {
        return false;
    };
    supported
        .iter()
        .filter_map(|v| normalize_version(v, prefix).ok())
        .any(|v| v == version)
}

/// Deprecation policy covering `version`, if any.
pub fn deprecation_policy<'a>(
    version: &str,
    deprecated: &'a [DeprecationPolicy],
    prefix: &str,
) -> Option<&'a DeprecationPolicy> {
    let version = normalize_version(version, prefix).ok()?;
    deprecated
        .iter()
        .find(|policy| normalize_version(&policy.version, prefix).is_ok_and(|v| v == version))
}

pub fn is_version_deprecated(version: &str, deprecated: &[DeprecationPolicy], prefix: &str) -> bool {
    deprecation_policy(version, deprecated, prefix).is_some()
}

/// Matches a `/{prefix}N[.N]` path segment; capture 1 is the bare version.
pub fn path_version_regex(prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"/{}(\d+(?:\.\d+)?)", regex::escape(prefix)))
}

pub fn extract_version_from_path(path: &str, prefix: &str) -> Option<String> {
    let regex = path_version_regex(prefix).ok()?;
    regex
        .captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Replace the first version segment of `path` or, if there is none,
/// prepend one: (`/v1/users`, `2`) -> `/v2/users`, (`/users`, `2`) -> `/v2/users`.
pub fn build_versioned_path(path: &str, version: &str, prefix: &str) -> String {
    let segment = format!("/{prefix}{version}");
    match path_version_regex(prefix) {
        Ok(regex) if regex.is_match(path) => regex.replacen(path, 1, segment.as_str()).into_owned(),
        _ => format!("{segment}{path}"),
    }
}

fn iso(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn generate_deprecation_message(
    version: &str,
    deprecated_since: Option<&DateTime<Utc>>,
    removal_date: Option<&DateTime<Utc>>,
    migration_guide: Option<&str>,
) -> String {
    let mut message = format!("API version {version} is deprecated");
    if let Some(since) = deprecated_since {
        message.push_str(&format!(" since {}", iso(since)));
    }
    if let Some(removal) = removal_date {
        message.push_str(&format!(" and will be removed on {}", iso(removal)));
    }
    if let Some(guide) = migration_guide {
        message.push_str(&format!(". Migration guide: {guide}"));
    }
    message
}
