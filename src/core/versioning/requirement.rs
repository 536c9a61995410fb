//! Route-level version restriction.
use http::Request;

use super::{VersionContext, VersionError, normalize_version};

/// The set of versions a route serves. An empty set serves every version.
#[derive(Debug, Clone, Default)]
pub struct VersionRequirement {
    declared: Vec<String>,
    normalized: Vec<String>,
    prefix: String,
}

impl VersionRequirement {
    pub fn new<I, S>(versions: I, prefix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = prefix.into();
        let declared: Vec<String> = versions.into_iter().map(Into::into).collect();
        let normalized = declared
            .iter()
            .filter_map(|v| normalize_version(v, &prefix).ok())
            .collect();
        Self {
            declared,
            normalized,
            prefix,
        }
    }

    pub fn versions(&self) -> &[String] {
        &self.declared
    }

    pub fn check_version(&self, version: &str) -> Result<(), VersionError> {
        if self.declared.is_empty() {
            return Ok(());
        }

        let accepted = normalize_version(version, &self.prefix)
            .is_ok_and(|version| self.normalized.contains(&version));
        if accepted {
            Ok(())
        } else {
            Err(VersionError::Unsupported {
                version: version.to_string(),
                supported: self.declared.clone(),
            })
        }
    }

    pub fn check(&self, context: &VersionContext) -> Result<(), VersionError> {
        self.check_version(context.version())
    }

    /// Check the context stored by the negotiation middleware.
    pub fn check_request<B>(&self, request: &Request<B>) -> Result<(), VersionError> {
        if self.declared.is_empty() {
            return Ok(());
        }
        match request.extensions().get::<VersionContext>() {
            Some(context) => self.check(context),
            None => Err(VersionError::VersionRequired),
        }
    }
}
