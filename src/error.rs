//! Error taxonomy for the CI integration core.
//!
//! One crate-wide enum covers every failure the subsystem can produce, from
//! store I/O to check-run API calls. The hook engine never propagates these
//! to its caller; it logs them and moves on (hooks must not block the primary
//! command). Store and provider *constructors* fail loudly.
//!
//! Most variants carry a remediation hint surfaced by [`CiError::remediation`]
//! so the host tool can print something actionable next to the error.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CiError>;

/// Every failure the CI core can produce.
#[derive(Debug, Error)]
pub enum CiError {
    /// Store upload failure (any backend).
    #[error("planfile upload failed for key '{key}': {source}")]
    PlanfileUpload {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Store download failure other than a missing object.
    #[error("planfile download failed for key '{key}': {source}")]
    PlanfileDownload {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Object absent.
    #[error("planfile not found: {key}")]
    PlanfileNotFound { key: String },

    /// Delete error other than not-found.
    #[error("planfile delete failed for key '{key}': {source}")]
    PlanfileDelete {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Existence check failed.
    #[error("planfile stat failed for key '{key}': {source}")]
    PlanfileStat {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Listing failed.
    #[error("planfile listing failed under prefix '{prefix}': {source}")]
    PlanfileList {
        prefix: String,
        #[source]
        source: anyhow::Error,
    },

    /// Sidecar metadata read/write error while the primary object is intact.
    #[error("planfile metadata error for key '{key}': {source}")]
    PlanfileMetadata {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Path traversal, empty key, or an empty required placeholder.
    #[error("invalid planfile key '{key}': {reason}")]
    KeyInvalid { key: String, reason: String },

    /// Unknown store type requested from the registry.
    #[error("unknown planfile store type: '{name}'")]
    StoreNotFound { name: String },

    /// Unknown provider name requested from the registry.
    #[error("unknown CI provider: '{name}'")]
    ProviderNotFound { name: String },

    /// No registered provider detected itself from the environment.
    #[error("no CI provider detected from the environment")]
    ProviderNotDetected,

    /// Summary or key/value output could not be written.
    #[error("CI output write failed for '{target}': {source}")]
    OutputWrite {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// Host API rejected a check-run creation.
    #[error("check run create failed: {source}")]
    CheckRunCreate {
        #[source]
        source: anyhow::Error,
    },

    /// Host API rejected a check-run update.
    #[error("check run update failed for id {id}: {source}")]
    CheckRunUpdate {
        id: i64,
        #[source]
        source: anyhow::Error,
    },

    /// Status aggregation against the host API failed.
    #[error("status query failed: {source}")]
    StatusQuery {
        #[source]
        source: anyhow::Error,
    },

    /// The provider cannot perform the requested operation.
    #[error("provider '{provider}' does not support {operation}")]
    OperationNotSupported {
        provider: String,
        operation: String,
    },

    /// Template parse or render failure; carries the template name.
    #[error("template '{name}' evaluation failed: {reason}")]
    TemplateEvaluation { name: String, reason: String },

    /// Missing GitHub credential.
    #[error("GitHub token not found")]
    TokenNotFound,

    /// Duplicate registration, malformed options, or similar setup problems.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Ambient I/O error not tied to a store key.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CiError {
    /// True when the error means "the object does not exist".
    ///
    /// Download actions use this to terminate gracefully instead of warning.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CiError::PlanfileNotFound { .. })
    }

    /// A short remediation hint, when one exists.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            CiError::TokenNotFound => {
                Some("Set GITHUB_TOKEN or GH_TOKEN in the workflow environment")
            }
            CiError::StoreNotFound { .. } => {
                Some("Valid store types: local, s3, github. Check ci.store.type")
            }
            CiError::ProviderNotFound { .. } => Some("Valid providers: github, generic"),
            CiError::ProviderNotDetected => Some(
                "Run inside a supported CI system, or force CI mode to use the generic provider",
            ),
            CiError::KeyInvalid { .. } => {
                Some("Keys are relative slash-separated paths without '..' segments")
            }
            CiError::TemplateEvaluation { .. } => {
                Some("Check the template for unbalanced '{{' or a malformed replace filter")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_predicate() {
        let err = CiError::PlanfileNotFound {
            key: "dev/vpc.tfplan".into(),
        };
        assert!(err.is_not_found());

        let err = CiError::PlanfileDownload {
            key: "dev/vpc.tfplan".into(),
            source: anyhow::anyhow!("socket closed"),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn key_invalid_display_names_the_key() {
        let err = CiError::KeyInvalid {
            key: "../../etc/passwd".into(),
            reason: "path traversal".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("../../etc/passwd"));
        assert!(msg.contains("path traversal"));
    }

    #[test]
    fn remediation_for_token_error() {
        assert!(CiError::TokenNotFound
            .remediation()
            .unwrap()
            .contains("GITHUB_TOKEN"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CiError = io.into();
        assert!(err.to_string().contains("denied"));
    }
}
