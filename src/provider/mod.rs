//! # CI Platform Abstraction
//!
//! Trait and implementations for the CI systems this core can talk to.
//!
//! ## Overview
//!
//! A platform provider knows how to:
//!
//! - detect itself from the environment (no network),
//! - describe the current run as a [`CiContext`],
//! - create and update commit check runs,
//! - write step outputs and job summaries,
//! - aggregate the status of a ref (optional).
//!
//! ## Available providers
//!
//! | Provider | Selected | Features |
//! |-----------|----------------------|-------------------------------------|
//! | `github` | auto-detected | real check runs, status aggregation |
//! | `generic` | forced-CI mode only | file/stderr outputs, synthetic ids |
//!
//! Providers register in the platform registry at startup; detection walks
//! registration order and returns the first match. The generic provider never
//! self-detects — it only serves as the forced-CI fallback.

pub mod generic;
pub mod github;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{CiError, Result};

// ---------------------------------------------------------------------------
// Check-run model
// ---------------------------------------------------------------------------

/// Internal check-run status vocabulary. Providers map this onto whatever
/// their API speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    InProgress,
    Success,
    Failure,
    Error,
    Cancelled,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pending => "pending",
            CheckStatus::InProgress => "in_progress",
            CheckStatus::Success => "success",
            CheckStatus::Failure => "failure",
            CheckStatus::Error => "error",
            CheckStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states complete a check run; the rest keep it open.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckStatus::Pending | CheckStatus::InProgress)
    }
}

/// A check run as seen by this core, independent of provider.
#[derive(Debug, Clone)]
pub struct CheckRun {
    pub id: i64,
    pub name: String,
    pub status: CheckStatus,
    /// Provider conclusion string; carries the real outcome once the run
    /// completes (the status alone loses that information).
    pub conclusion: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub details_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for creating a check run.
#[derive(Debug, Clone, Default)]
pub struct CheckRunOptions {
    pub name: String,
    pub head_sha: String,
    pub status: Option<CheckStatus>,
    /// Explicit conclusion; overrides the one derived from `status`.
    pub conclusion: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub details_url: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for updating an existing check run. `name` is mandatory; the host
/// API requires it on update.
#[derive(Debug, Clone, Default)]
pub struct CheckRunUpdate {
    pub id: i64,
    pub name: String,
    pub status: Option<CheckStatus>,
    pub conclusion: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub details_url: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Run context and status aggregation
// ---------------------------------------------------------------------------

/// What the provider knows about the current CI run, pulled from well-known
/// environment variables. All fields are best-effort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CiContext {
    /// `owner/name`.
    pub repository: String,
    pub branch: String,
    pub sha: String,
    pub actor: String,
    pub pr_number: Option<u64>,
    pub run_id: Option<u64>,
}

impl CiContext {
    /// Split `repository` into `(owner, name)` when well-formed.
    pub fn owner_repo(&self) -> Option<(&str, &str)> {
        self.repository.split_once('/')
    }
}

/// Inputs for [`CiPlatform::get_status`].
#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    /// Commit SHA or branch to aggregate.
    pub git_ref: String,
    /// Also pull the authenticated user's open and review-requested PRs.
    pub include_prs: bool,
}

/// One check or legacy status, normalized.
#[derive(Debug, Clone)]
pub struct CheckSummary {
    pub name: String,
    /// Normalized state: `success`, `failure`, `pending`, `skipped`, ...
    pub state: String,
}

/// A pull request surfaced by status aggregation.
#[derive(Debug, Clone, Deserialize)]
pub struct PrSummary {
    pub number: u64,
    pub title: String,
    #[serde(rename = "html_url")]
    pub url: String,
}

/// Aggregated status of a ref.
#[derive(Debug, Clone, Default)]
pub struct AggregatedStatus {
    pub checks: Vec<CheckSummary>,
    /// Every check's normalized state is `success` or `skipped`.
    pub all_passed: bool,
    pub prs_created: Vec<PrSummary>,
    pub prs_awaiting_review: Vec<PrSummary>,
}

// ---------------------------------------------------------------------------
// Output writing
// ---------------------------------------------------------------------------

/// Key/value output and job-summary sink.
pub trait OutputWriter: Send + Sync {
    /// Write one output entry. Multi-line values use heredoc framing.
    fn write_output(&self, key: &str, value: &str) -> Result<()>;

    /// Append markdown to the job summary.
    fn write_summary(&self, text: &str) -> Result<()>;
}

/// Format one output entry in the `key=value` file format.
///
/// Single-line values produce `key=value\n`. Multi-line values use a heredoc
/// whose delimiter starts at `EOF` and grows trailing underscores until it no
/// longer occurs within the value:
///
/// ```text
/// key<<EOF_
/// line1
/// EOF
/// line2
/// EOF_
/// ```
pub fn format_output_entry(key: &str, value: &str) -> String {
    if !value.contains('\n') {
        return format!("{key}={value}\n");
    }
    let mut delimiter = String::from("EOF");
    while value.contains(&delimiter) {
        delimiter.push('_');
    }
    format!("{key}<<{delimiter}\n{value}\n{delimiter}\n")
}

// ---------------------------------------------------------------------------
// Platform trait
// ---------------------------------------------------------------------------

/// A CI platform this core can integrate with.
#[async_trait]
pub trait CiPlatform: Send + Sync {
    /// Registry name (`github`, `generic`).
    fn name(&self) -> &'static str;

    /// Environment-only self-detection. Never touches the network.
    fn detect(&self) -> bool;

    /// Build the run context from the platform's environment variables.
    fn context(&self) -> Result<CiContext>;

    /// Aggregate the status of a ref. Optional; the default declines.
    async fn get_status(&self, _opts: &StatusOptions) -> Result<AggregatedStatus> {
        Err(CiError::OperationNotSupported {
            provider: self.name().to_string(),
            operation: "status aggregation".to_string(),
        })
    }

    async fn create_check_run(&self, opts: &CheckRunOptions) -> Result<CheckRun>;

    async fn update_check_run(&self, opts: &CheckRunUpdate) -> Result<CheckRun>;

    /// The output sink, when this platform has one.
    fn output_writer(&self) -> Option<Arc<dyn OutputWriter>>;
}

// ---------------------------------------------------------------------------
// Provider registry
// ---------------------------------------------------------------------------

struct ProviderRegistry {
    /// Insertion order drives detection priority.
    order: Vec<String>,
    providers: HashMap<String, Arc<dyn CiPlatform>>,
}

static REGISTRY: Lazy<RwLock<ProviderRegistry>> = Lazy::new(|| {
    RwLock::new(ProviderRegistry {
        order: Vec::new(),
        providers: HashMap::new(),
    })
});

/// Register a platform provider. Duplicate names fail.
pub fn register_provider(name: &str, provider: Arc<dyn CiPlatform>) -> Result<()> {
    let mut registry = REGISTRY.write().expect("provider registry poisoned");
    if registry.providers.contains_key(name) {
        return Err(CiError::InvalidConfig(format!(
            "provider '{name}' is already registered"
        )));
    }
    registry.order.push(name.to_string());
    registry.providers.insert(name.to_string(), provider);
    Ok(())
}

/// Look up a provider by name.
pub fn get_provider(name: &str) -> Result<Arc<dyn CiPlatform>> {
    let registry = REGISTRY.read().expect("provider registry poisoned");
    registry
        .providers
        .get(name)
        .cloned()
        .ok_or_else(|| CiError::ProviderNotFound {
            name: name.to_string(),
        })
}

/// First provider (in registration order) that detects itself.
pub fn detect_provider() -> Option<Arc<dyn CiPlatform>> {
    let registry = REGISTRY.read().expect("provider registry poisoned");
    registry
        .order
        .iter()
        .filter_map(|name| registry.providers.get(name))
        .find(|p| p.detect())
        .cloned()
}

/// Resolve the active platform per the engine's dispatch rules: detection
/// first; under forced CI mode, fall back to the generic provider.
pub fn resolve_provider(force_ci_mode: bool) -> Option<Arc<dyn CiPlatform>> {
    if let Some(provider) = detect_provider() {
        return Some(provider);
    }
    if force_ci_mode {
        return get_provider(generic::PROVIDER_NAME).ok();
    }
    None
}

/// Register the built-in providers. Called from [`crate::register_builtins`].
pub(crate) fn register_builtin_providers() {
    let _ = register_provider(github::PROVIDER_NAME, Arc::new(github::GithubPlatform::new()));
    let _ = register_provider(
        generic::PROVIDER_NAME,
        Arc::new(generic::GenericPlatform::new()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_output_entry() {
        assert_eq!(format_output_entry("k", "v"), "k=v\n");
        assert_eq!(format_output_entry("empty", ""), "empty=\n");
    }

    #[test]
    fn multiline_output_uses_heredoc() {
        assert_eq!(
            format_output_entry("k", "line1\nline2"),
            "k<<EOF\nline1\nline2\nEOF\n"
        );
    }

    #[test]
    fn heredoc_delimiter_extends_past_collisions() {
        assert_eq!(
            format_output_entry("k", "line1\nEOF\nline2"),
            "k<<EOF_\nline1\nEOF\nline2\nEOF_\n"
        );
        // Both EOF and EOF_ occur: two underscores.
        assert_eq!(
            format_output_entry("k", "EOF\nEOF_"),
            "k<<EOF__\nEOF\nEOF_\nEOF__\n"
        );
    }

    #[test]
    fn status_terminality() {
        assert!(!CheckStatus::Pending.is_terminal());
        assert!(!CheckStatus::InProgress.is_terminal());
        for status in [
            CheckStatus::Success,
            CheckStatus::Failure,
            CheckStatus::Error,
            CheckStatus::Cancelled,
        ] {
            assert!(status.is_terminal(), "{status:?} should be terminal");
        }
    }

    #[test]
    fn context_owner_repo_split() {
        let ctx = CiContext {
            repository: "cloudposse/infrastructure".into(),
            ..Default::default()
        };
        assert_eq!(ctx.owner_repo(), Some(("cloudposse", "infrastructure")));

        let bad = CiContext::default();
        assert_eq!(bad.owner_repo(), None);
    }

    #[test]
    fn registry_rejects_duplicates_and_resolves() {
        // The built-ins may already be present from another test; ignore.
        register_builtin_providers();
        let err = register_provider(
            generic::PROVIDER_NAME,
            Arc::new(generic::GenericPlatform::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("already registered"));

        assert!(get_provider("github").is_ok());
        assert!(matches!(
            get_provider("jenkins"),
            Err(CiError::ProviderNotFound { .. })
        ));
    }
}
