//! Generic fallback provider for forced-CI mode.
//!
//! Never auto-detected; the engine only selects it when forced CI mode is on
//! and no real platform detected itself. Context fields come from a
//! prioritized list of environment variables covering the common CI vendors
//! (the `ATMOS_CI_*` overrides always win). Check-run operations return
//! synthetic records with process-local monotonic ids and surface state to
//! the terminal.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use colored::Colorize;
use tracing::debug;

use crate::error::{CiError, Result};
use crate::provider::{
    format_output_entry, CheckRun, CheckRunOptions, CheckRunUpdate, CheckStatus, CiContext,
    CiPlatform, OutputWriter,
};

pub const PROVIDER_NAME: &str = "generic";

/// Output/summary file targets, overridable per process.
pub const OUTPUT_ENV: &str = "ATMOS_CI_OUTPUT";
pub const SUMMARY_ENV: &str = "ATMOS_CI_SUMMARY";

const SHA_VARS: &[&str] = &[
    "ATMOS_CI_SHA",
    "GITHUB_SHA",
    "CI_COMMIT_SHA",
    "CIRCLE_SHA1",
    "TRAVIS_COMMIT",
    "BUILDKITE_COMMIT",
    "DRONE_COMMIT_SHA",
];

const BRANCH_VARS: &[&str] = &[
    "ATMOS_CI_BRANCH",
    "GITHUB_REF_NAME",
    "CI_COMMIT_REF_NAME",
    "CIRCLE_BRANCH",
    "TRAVIS_BRANCH",
    "BUILDKITE_BRANCH",
    "DRONE_BRANCH",
];

const REPOSITORY_VARS: &[&str] = &[
    "ATMOS_CI_REPOSITORY",
    "GITHUB_REPOSITORY",
    "CI_PROJECT_PATH",
    "TRAVIS_REPO_SLUG",
    "DRONE_REPO",
];

const ACTOR_VARS: &[&str] = &[
    "ATMOS_CI_ACTOR",
    "GITHUB_ACTOR",
    "GITLAB_USER_LOGIN",
    "CIRCLE_USERNAME",
    "BUILDKITE_BUILD_CREATOR",
];

const RUN_ID_VARS: &[&str] = &[
    "ATMOS_CI_RUN_ID",
    "GITHUB_RUN_ID",
    "CI_PIPELINE_ID",
    "CIRCLE_BUILD_NUM",
    "BUILDKITE_BUILD_NUMBER",
];

const PR_VARS: &[&str] = &[
    "ATMOS_CI_PR_NUMBER",
    "CI_MERGE_REQUEST_IID",
    "CIRCLE_PR_NUMBER",
    "BUILDKITE_PULL_REQUEST",
];

fn first_env(vars: &[&str]) -> String {
    vars.iter()
        .filter_map(|v| std::env::var(v).ok())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

pub struct GenericPlatform {
    next_id: AtomicI64,
}

impl Default for GenericPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericPlatform {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    fn surface(status: CheckStatus, name: &str, title: Option<&str>) {
        let label = title.unwrap_or("");
        let line = match status {
            CheckStatus::Success => format!("{} {name} {label}", "✓".green()),
            CheckStatus::Failure | CheckStatus::Error => {
                format!("{} {name} {label}", "✗".red())
            }
            CheckStatus::Cancelled => format!("{} {name} cancelled", "-".yellow()),
            CheckStatus::Pending | CheckStatus::InProgress => {
                format!("{} {name} {label}", "…".cyan())
            }
        };
        eprintln!("{}", line.trim_end());
    }
}

#[async_trait]
impl CiPlatform for GenericPlatform {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    /// The generic provider is a fallback, never a detection result.
    fn detect(&self) -> bool {
        false
    }

    fn context(&self) -> Result<CiContext> {
        Ok(CiContext {
            repository: first_env(REPOSITORY_VARS),
            branch: first_env(BRANCH_VARS),
            sha: first_env(SHA_VARS),
            actor: first_env(ACTOR_VARS),
            pr_number: parse_number(&first_env(PR_VARS)),
            run_id: parse_number(&first_env(RUN_ID_VARS)),
        })
    }

    async fn create_check_run(&self, opts: &CheckRunOptions) -> Result<CheckRun> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let status = opts.status.unwrap_or(CheckStatus::Pending);
        Self::surface(status, &opts.name, opts.title.as_deref());
        Ok(CheckRun {
            id,
            name: opts.name.clone(),
            status,
            conclusion: opts.conclusion.clone(),
            title: opts.title.clone(),
            summary: opts.summary.clone(),
            details_url: opts.details_url.clone(),
            started_at: Some(Utc::now()),
            completed_at: opts.completed_at,
        })
    }

    async fn update_check_run(&self, opts: &CheckRunUpdate) -> Result<CheckRun> {
        let status = opts.status.unwrap_or(CheckStatus::Success);
        Self::surface(status, &opts.name, opts.title.as_deref());
        Ok(CheckRun {
            id: opts.id,
            name: opts.name.clone(),
            status,
            conclusion: opts.conclusion.clone(),
            title: opts.title.clone(),
            summary: opts.summary.clone(),
            details_url: opts.details_url.clone(),
            started_at: None,
            completed_at: opts.completed_at,
        })
    }

    fn output_writer(&self) -> Option<Arc<dyn OutputWriter>> {
        Some(Arc::new(GenericOutputWriter))
    }
}

fn parse_number(raw: &str) -> Option<u64> {
    if raw.is_empty() {
        None
    } else {
        raw.parse().ok()
    }
}

/// Writes to the files named by `ATMOS_CI_OUTPUT` / `ATMOS_CI_SUMMARY`, or
/// to the debug log when neither is set.
pub struct GenericOutputWriter;

impl GenericOutputWriter {
    fn append(env_var: &str, content: &str) -> Result<()> {
        let Some(path) = std::env::var(env_var).ok().filter(|p| !p.is_empty()) else {
            debug!(target_var = env_var, content, "no output file configured");
            return Ok(());
        };
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CiError::OutputWrite {
                target: path.clone(),
                source: e.into(),
            })?;
        file.write_all(content.as_bytes())
            .map_err(|e| CiError::OutputWrite {
                target: path,
                source: e.into(),
            })
    }
}

impl OutputWriter for GenericOutputWriter {
    fn write_output(&self, key: &str, value: &str) -> Result<()> {
        Self::append(OUTPUT_ENV, &format_output_entry(key, value))
    }

    fn write_summary(&self, text: &str) -> Result<()> {
        let mut content = text.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        Self::append(SUMMARY_ENV, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_ids_are_monotonic() {
        let platform = GenericPlatform::new();
        let opts = CheckRunOptions {
            name: "atmos/plan: dev/vpc".into(),
            status: Some(CheckStatus::InProgress),
            ..Default::default()
        };
        let a = platform.create_check_run(&opts).await.unwrap();
        let b = platform.create_check_run(&opts).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn update_echoes_fields() {
        let platform = GenericPlatform::new();
        let run = platform
            .update_check_run(&CheckRunUpdate {
                id: 9,
                name: "atmos/plan: dev/vpc".into(),
                status: Some(CheckStatus::Failure),
                conclusion: Some("failure".into()),
                title: Some("2 to destroy".into()),
                completed_at: Some(Utc::now()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(run.id, 9);
        assert_eq!(run.status, CheckStatus::Failure);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn never_detects() {
        assert!(!GenericPlatform::new().detect());
    }

    #[test]
    fn number_parsing_tolerates_garbage() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("false"), None);
    }
}
