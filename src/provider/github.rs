//! GitHub platform provider.
//!
//! Detection is environment-only (`GITHUB_ACTIONS`). Check-run operations
//! translate the internal status vocabulary onto the checks API:
//!
//! | internal | API `status` | API `conclusion` |
//! |-------------|--------------|------------------|
//! | pending | queued | — |
//! | in_progress | in_progress | — |
//! | success | completed | success |
//! | failure | completed | failure |
//! | error | completed | failure |
//! | cancelled | completed | cancelled |
//!
//! An explicit conclusion supplied by the caller always overrides the derived
//! one. Status aggregation unions the check-runs endpoint with the legacy
//! combined-status endpoint and can pull the authenticated user's open and
//! review-requested pull requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{CiError, Result};
use crate::provider::{
    format_output_entry, AggregatedStatus, CheckRun, CheckRunOptions, CheckRunUpdate,
    CheckStatus, CheckSummary, CiContext, CiPlatform, OutputWriter, PrSummary, StatusOptions,
};

pub const PROVIDER_NAME: &str = "github";

const DEFAULT_API_BASE: &str = "https://api.github.com";

pub struct GithubPlatform {
    api_base: String,
}

impl Default for GithubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl GithubPlatform {
    pub fn new() -> Self {
        Self {
            api_base: std::env::var("GITHUB_API_URL")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        }
    }

    /// Fresh authenticated client. Providers are stateless; construction is
    /// cheap and the token is re-read so long-lived processes pick up
    /// rotation.
    fn client(&self) -> Result<reqwest::Client> {
        let token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or(CiError::TokenNotFound)?;

        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| CiError::InvalidConfig("token contains invalid characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );

        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("atmos-ci/0.1")
            .default_headers(headers)
            .build()
            .map_err(|e| CiError::InvalidConfig(format!("http client: {e}")))
    }

    fn owner_repo(&self) -> Result<(String, String)> {
        let repository = std::env::var("GITHUB_REPOSITORY").unwrap_or_default();
        repository
            .split_once('/')
            .map(|(o, r)| (o.to_string(), r.to_string()))
            .ok_or_else(|| {
                CiError::InvalidConfig(format!(
                    "GITHUB_REPOSITORY must be owner/name, got '{repository}'"
                ))
            })
    }

    fn check_run_body(
        name: &str,
        head_sha: Option<&str>,
        status: Option<CheckStatus>,
        explicit_conclusion: Option<&str>,
        title: Option<&str>,
        summary: Option<&str>,
        details_url: Option<&str>,
        completed_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> serde_json::Value {
        let mut body = json!({ "name": name });
        if let Some(sha) = head_sha {
            body["head_sha"] = json!(sha);
        }
        if let Some(status) = status {
            let (api_status, derived) = map_status_to_api(status);
            body["status"] = json!(api_status);
            // Explicit conclusion wins over the derived one.
            if let Some(conclusion) = explicit_conclusion.or(derived) {
                body["conclusion"] = json!(conclusion);
            }
        } else if let Some(conclusion) = explicit_conclusion {
            body["conclusion"] = json!(conclusion);
        }
        if let Some(completed_at) = completed_at {
            body["completed_at"] =
                json!(completed_at.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        if let Some(details_url) = details_url {
            body["details_url"] = json!(details_url);
        }
        if title.is_some() || summary.is_some() {
            body["output"] = json!({
                "title": title.unwrap_or(""),
                "summary": summary.unwrap_or(""),
            });
        }
        body
    }

    async fn send_check_run(
        &self,
        method: reqwest::Method,
        url: String,
        body: serde_json::Value,
    ) -> anyhow::Result<CheckRun> {
        let client = self.client().map_err(|e| anyhow::anyhow!(e))?;
        let resp = client.request(method, &url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("{url} returned {status}: {text}");
        }
        let api: ApiCheckRun = resp.json().await?;
        Ok(api.into_check_run())
    }
}

#[async_trait]
impl CiPlatform for GithubPlatform {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn detect(&self) -> bool {
        std::env::var("GITHUB_ACTIONS").map(|v| v == "true").unwrap_or(false)
    }

    fn context(&self) -> Result<CiContext> {
        let head_ref = std::env::var("GITHUB_HEAD_REF").unwrap_or_default();
        let ref_name = std::env::var("GITHUB_REF_NAME").unwrap_or_default();
        let branch = if head_ref.is_empty() { ref_name.clone() } else { head_ref };

        let pr_number = std::env::var("GITHUB_REF")
            .ok()
            .and_then(|r| parse_pr_ref(&r))
            .or_else(|| parse_pr_ref(&ref_name));

        Ok(CiContext {
            repository: std::env::var("GITHUB_REPOSITORY").unwrap_or_default(),
            branch,
            sha: std::env::var("GITHUB_SHA").unwrap_or_default(),
            actor: std::env::var("GITHUB_ACTOR").unwrap_or_default(),
            pr_number,
            run_id: std::env::var("GITHUB_RUN_ID").ok().and_then(|v| v.parse().ok()),
        })
    }

    async fn get_status(&self, opts: &StatusOptions) -> Result<AggregatedStatus> {
        let (owner, repo) = self.owner_repo()?;
        let client = self.client()?;
        let map_err = |e: anyhow::Error| CiError::StatusQuery { source: e };

        // Modern check runs for the ref.
        let check_runs_url = format!(
            "{}/repos/{owner}/{repo}/commits/{}/check-runs",
            self.api_base, opts.git_ref
        );
        let page: ApiCheckRunPage = get_json(&client, &check_runs_url).await.map_err(map_err)?;

        let mut checks: Vec<CheckSummary> = page
            .check_runs
            .into_iter()
            .map(|run| CheckSummary {
                state: normalize_check_run_state(&run.status, run.conclusion.as_deref()),
                name: run.name,
            })
            .collect();

        // Legacy combined statuses; union by name, check runs win.
        let status_url = format!(
            "{}/repos/{owner}/{repo}/commits/{}/status",
            self.api_base, opts.git_ref
        );
        let combined: ApiCombinedStatus = get_json(&client, &status_url).await.map_err(map_err)?;
        for status in combined.statuses {
            if checks.iter().any(|c| c.name == status.context) {
                continue;
            }
            checks.push(CheckSummary {
                name: status.context,
                state: status.state,
            });
        }

        let all_passed = checks
            .iter()
            .all(|c| c.state == "success" || c.state == "skipped");

        let mut result = AggregatedStatus {
            checks,
            all_passed,
            ..Default::default()
        };

        if opts.include_prs {
            let search = |query: String| {
                let client = client.clone();
                let url = format!("{}/search/issues", self.api_base);
                async move {
                    let resp = client.get(&url).query(&[("q", query)]).send().await?;
                    if !resp.status().is_success() {
                        anyhow::bail!("search returned {}", resp.status());
                    }
                    let page: ApiSearchPage = resp.json().await?;
                    Ok::<_, anyhow::Error>(page.items)
                }
            };
            let repo_scope = format!("repo:{owner}/{repo}");
            result.prs_created = search(format!("is:pr is:open author:@me {repo_scope}"))
                .await
                .map_err(map_err)?;
            result.prs_awaiting_review =
                search(format!("is:pr is:open review-requested:@me {repo_scope}"))
                    .await
                    .map_err(map_err)?;
        }

        Ok(result)
    }

    async fn create_check_run(&self, opts: &CheckRunOptions) -> Result<CheckRun> {
        let (owner, repo) = self
            .owner_repo()
            .map_err(|e| CiError::CheckRunCreate { source: e.into() })?;
        let url = format!("{}/repos/{owner}/{repo}/check-runs", self.api_base);
        let body = Self::check_run_body(
            &opts.name,
            Some(&opts.head_sha),
            opts.status,
            opts.conclusion.as_deref(),
            opts.title.as_deref(),
            opts.summary.as_deref(),
            opts.details_url.as_deref(),
            opts.completed_at,
        );
        self.send_check_run(reqwest::Method::POST, url, body)
            .await
            .map_err(|source| CiError::CheckRunCreate { source })
    }

    async fn update_check_run(&self, opts: &CheckRunUpdate) -> Result<CheckRun> {
        // The API requires the run name on update.
        if opts.name.is_empty() {
            return Err(CiError::CheckRunUpdate {
                id: opts.id,
                source: anyhow::anyhow!("check run name is required on update"),
            });
        }
        let (owner, repo) = self.owner_repo().map_err(|e| CiError::CheckRunUpdate {
            id: opts.id,
            source: e.into(),
        })?;
        let url = format!(
            "{}/repos/{owner}/{repo}/check-runs/{}",
            self.api_base, opts.id
        );
        let body = Self::check_run_body(
            &opts.name,
            None,
            opts.status,
            opts.conclusion.as_deref(),
            opts.title.as_deref(),
            opts.summary.as_deref(),
            opts.details_url.as_deref(),
            opts.completed_at,
        );
        self.send_check_run(reqwest::Method::PATCH, url, body)
            .await
            .map_err(|source| CiError::CheckRunUpdate {
                id: opts.id,
                source,
            })
    }

    fn output_writer(&self) -> Option<Arc<dyn OutputWriter>> {
        Some(Arc::new(GithubOutputWriter))
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<T> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("{url} returned {}", resp.status());
    }
    Ok(resp.json().await?)
}

/// Append-based writer over the `GITHUB_OUTPUT` / `GITHUB_STEP_SUMMARY`
/// files. A missing target variable makes the write a logged no-op.
pub struct GithubOutputWriter;

impl GithubOutputWriter {
    fn append(env_var: &str, content: &str) -> Result<()> {
        let Some(path) = std::env::var(env_var).ok().filter(|p| !p.is_empty()) else {
            debug!(target_var = env_var, "output target not set; skipping write");
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

impl OutputWriter for GithubOutputWriter {
    fn write_output(&self, key: &str, value: &str) -> Result<()> {
        Self::append("GITHUB_OUTPUT", &format_output_entry(key, value))
    }

    fn write_summary(&self, text: &str) -> Result<()> {
        let mut content = text.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        Self::append("GITHUB_STEP_SUMMARY", &content)
    }
}

/// `refs/pull/<n>/merge` or `<n>/merge` to a PR number.
fn parse_pr_ref(git_ref: &str) -> Option<u64> {
    let rest = git_ref.strip_prefix("refs/pull/").unwrap_or(git_ref);
    let (number, tail) = rest.split_once('/')?;
    if tail == "merge" || tail == "head" {
        number.parse().ok()
    } else {
        None
    }
}

/// Internal status to checks-API `(status, derived conclusion)`.
pub fn map_status_to_api(status: CheckStatus) -> (&'static str, Option<&'static str>) {
    match status {
        CheckStatus::Pending => ("queued", None),
        CheckStatus::InProgress => ("in_progress", None),
        CheckStatus::Success => ("completed", Some("success")),
        CheckStatus::Failure => ("completed", Some("failure")),
        CheckStatus::Error => ("completed", Some("failure")),
        CheckStatus::Cancelled => ("completed", Some("cancelled")),
    }
}

/// Checks-API response fields back to the internal vocabulary. Completed
/// runs take their real outcome from the conclusion.
pub fn map_api_to_status(status: &str, conclusion: Option<&str>) -> CheckStatus {
    match status {
        "queued" => CheckStatus::Pending,
        "in_progress" => CheckStatus::InProgress,
        "completed" => match conclusion {
            Some("success") | Some("neutral") | Some("skipped") => CheckStatus::Success,
            Some("cancelled") => CheckStatus::Cancelled,
            Some("failure") | Some("timed_out") | Some("action_required") => CheckStatus::Failure,
            _ => CheckStatus::Error,
        },
        _ => CheckStatus::Pending,
    }
}

fn normalize_check_run_state(status: &str, conclusion: Option<&str>) -> String {
    if status == "completed" {
        conclusion.unwrap_or("unknown").to_string()
    } else {
        "pending".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ApiCheckRun {
    id: i64,
    name: String,
    status: String,
    conclusion: Option<String>,
    details_url: Option<String>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    output: Option<ApiCheckRunOutput>,
}

#[derive(Debug, Deserialize)]
struct ApiCheckRunOutput {
    title: Option<String>,
    summary: Option<String>,
}

impl ApiCheckRun {
    fn into_check_run(self) -> CheckRun {
        let status = map_api_to_status(&self.status, self.conclusion.as_deref());
        let (title, summary) = self
            .output
            .map(|o| (o.title, o.summary))
            .unwrap_or((None, None));
        CheckRun {
            id: self.id,
            name: self.name,
            status,
            conclusion: self.conclusion,
            title,
            summary,
            details_url: self.details_url,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiCheckRunPage {
    check_runs: Vec<ApiCheckRunListEntry>,
}

#[derive(Debug, Deserialize)]
struct ApiCheckRunListEntry {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCombinedStatus {
    statuses: Vec<ApiStatusEntry>,
}

#[derive(Debug, Deserialize)]
struct ApiStatusEntry {
    context: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct ApiSearchPage {
    items: Vec<PrSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_to_api() {
        assert_eq!(map_status_to_api(CheckStatus::Pending), ("queued", None));
        assert_eq!(
            map_status_to_api(CheckStatus::InProgress),
            ("in_progress", None)
        );
        assert_eq!(
            map_status_to_api(CheckStatus::Success),
            ("completed", Some("success"))
        );
        assert_eq!(
            map_status_to_api(CheckStatus::Failure),
            ("completed", Some("failure"))
        );
        assert_eq!(
            map_status_to_api(CheckStatus::Error),
            ("completed", Some("failure"))
        );
        assert_eq!(
            map_status_to_api(CheckStatus::Cancelled),
            ("completed", Some("cancelled"))
        );
    }

    #[test]
    fn status_mapping_from_api() {
        assert_eq!(map_api_to_status("queued", None), CheckStatus::Pending);
        assert_eq!(
            map_api_to_status("in_progress", None),
            CheckStatus::InProgress
        );
        assert_eq!(
            map_api_to_status("completed", Some("success")),
            CheckStatus::Success
        );
        assert_eq!(
            map_api_to_status("completed", Some("timed_out")),
            CheckStatus::Failure
        );
        assert_eq!(
            map_api_to_status("completed", Some("cancelled")),
            CheckStatus::Cancelled
        );
        assert_eq!(map_api_to_status("completed", None), CheckStatus::Error);
    }

    #[test]
    fn explicit_conclusion_overrides_derived() {
        let body = GithubPlatform::check_run_body(
            "atmos/plan: dev/vpc",
            Some("abc123"),
            Some(CheckStatus::Success),
            Some("neutral"),
            None,
            None,
            None,
            None,
        );
        assert_eq!(body["status"], "completed");
        assert_eq!(body["conclusion"], "neutral");
    }

    #[test]
    fn check_run_body_includes_output_pair() {
        let body = GithubPlatform::check_run_body(
            "atmos/plan: dev/vpc",
            Some("abc123"),
            Some(CheckStatus::InProgress),
            None,
            Some("1 to add"),
            None,
            None,
            None,
        );
        assert_eq!(body["status"], "in_progress");
        assert!(body.get("conclusion").is_none());
        assert_eq!(body["output"]["title"], "1 to add");
        assert_eq!(body["output"]["summary"], "");
    }

    #[test]
    fn pr_ref_parsing() {
        assert_eq!(parse_pr_ref("refs/pull/128/merge"), Some(128));
        assert_eq!(parse_pr_ref("128/merge"), Some(128));
        assert_eq!(parse_pr_ref("refs/pull/7/head"), Some(7));
        assert_eq!(parse_pr_ref("refs/heads/main"), None);
        assert_eq!(parse_pr_ref("main"), None);
    }

    #[test]
    fn normalize_states() {
        assert_eq!(normalize_check_run_state("completed", Some("success")), "success");
        assert_eq!(normalize_check_run_state("completed", None), "unknown");
        assert_eq!(normalize_check_run_state("in_progress", None), "pending");
    }
}
