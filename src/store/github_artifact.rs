//! GitHub Actions artifact-backed planfile store.
//!
//! Each key maps to one workflow artifact named `planfile-<sanitized-key>`,
//! where sanitization replaces both `/` and `\` with `--` (artifact names
//! cannot contain path separators). The artifact is a zip bundle holding the
//! planfile as `plan.tfplan` plus an optional `metadata.json` sidecar.
//!
//! Listing and download use the documented REST artifact endpoints. Upload
//! requires the runner-internal artifact toolkit, which this crate does not
//! reimplement: the bundle is built and validated, then the call reports the
//! operation as unsupported. Retention is a day count honored by GitHub; the
//! store records it at construction and stamps `expires_at` accordingly.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{CiError, Result};
use crate::store::key::clean_key;
use crate::store::{
    sort_newest_first, PlanfileInfo, PlanfileMetadata, PlanfileStore, StoreFactory, StoreOptions,
    DEFAULT_RETENTION_DAYS,
};

pub const STORE_TYPE: &str = "github";

/// Artifact name prefix for planfile bundles.
pub const ARTIFACT_PREFIX: &str = "planfile-";
/// Entry name of the planfile inside the bundle.
pub const BUNDLE_PLAN_ENTRY: &str = "plan.tfplan";
/// Entry name of the sidecar inside the bundle.
pub const BUNDLE_METADATA_ENTRY: &str = "metadata.json";

const DEFAULT_API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

/// Registry factory for `github` stores. `owner`/`repo` fall back to
/// `GITHUB_REPOSITORY`; the token comes from `token`, `GITHUB_TOKEN`, or
/// `GH_TOKEN`.
pub fn factory(opts: &StoreOptions) -> BoxFuture<'_, Result<Arc<dyn PlanfileStore>>> {
    Box::pin(async move {
        let (owner, repo) = resolve_owner_repo(opts)?;
        let token = resolve_token(opts)?;
        let retention_days = opts
            .get_u32("retention_days")?
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        let api_base = opts
            .get("api_url")
            .map(str::to_string)
            .or_else(|| std::env::var("GITHUB_API_URL").ok())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let store = GithubArtifactStore::new(owner, repo, token, retention_days, api_base)?;
        Ok(Arc::new(store) as Arc<dyn PlanfileStore>)
    })
}

const _: StoreFactory = factory;

fn resolve_owner_repo(opts: &StoreOptions) -> Result<(String, String)> {
    if let (Some(owner), Some(repo)) = (opts.get("owner"), opts.get("repo")) {
        if !owner.is_empty() && !repo.is_empty() {
            return Ok((owner.to_string(), repo.to_string()));
        }
    }
    if let Ok(repository) = std::env::var("GITHUB_REPOSITORY") {
        if let Some((owner, repo)) = repository.split_once('/') {
            return Ok((owner.to_string(), repo.to_string()));
        }
    }
    Err(CiError::InvalidConfig(
        "github store requires owner/repo options or GITHUB_REPOSITORY".to_string(),
    ))
}

fn resolve_token(opts: &StoreOptions) -> Result<String> {
    if let Some(token) = opts.get("token") {
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }
    std::env::var("GITHUB_TOKEN")
        .or_else(|_| std::env::var("GH_TOKEN"))
        .ok()
        .filter(|t| !t.is_empty())
        .ok_or(CiError::TokenNotFound)
}

#[derive(Debug, Deserialize)]
struct ArtifactPage {
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
struct Artifact {
    id: i64,
    name: String,
    size_in_bytes: u64,
    expired: bool,
    archive_download_url: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct GithubArtifactStore {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    retention_days: u32,
}

impl GithubArtifactStore {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: impl Into<String>,
        retention_days: u32,
        api_base: impl Into<String>,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            token.into()
        ))
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

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("atmos-ci/0.1")
            .default_headers(headers)
            .build()
            .map_err(|e| CiError::InvalidConfig(format!("http client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            retention_days,
        })
    }

    /// Retention recorded at construction, in days.
    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    fn artifacts_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/actions/artifacts",
            self.api_base, self.owner, self.repo
        )
    }

    /// Newest non-expired artifact with exactly this name.
    async fn find_artifact(&self, name: &str) -> anyhow::Result<Option<Artifact>> {
        let resp = self
            .client
            .get(self.artifacts_url())
            .query(&[("name", name), ("per_page", "100")])
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("artifact lookup returned {}", resp.status());
        }
        let page: ArtifactPage = resp.json().await?;
        Ok(page
            .artifacts
            .into_iter()
            .filter(|a| !a.expired)
            .max_by_key(|a| a.created_at))
    }

    async fn fetch_all_artifacts(&self) -> anyhow::Result<Vec<Artifact>> {
        let mut all = Vec::new();
        for page in 1.. {
            let resp = self
                .client
                .get(self.artifacts_url())
                .query(&[
                    ("per_page", PER_PAGE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?;
            if !resp.status().is_success() {
                anyhow::bail!("artifact listing returned {}", resp.status());
            }
            let batch: ArtifactPage = resp.json().await?;
            let n = batch.artifacts.len();
            all.extend(batch.artifacts);
            if n < PER_PAGE {
                break;
            }
        }
        Ok(all)
    }

    async fn download_bundle(&self, artifact: &Artifact) -> anyhow::Result<Vec<u8>> {
        // The download URL redirects to short-lived signed storage; reqwest
        // follows it and drops the Authorization header across hosts.
        let resp = self
            .client
            .get(&artifact.archive_download_url)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("artifact download returned {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PlanfileStore for GithubArtifactStore {
    fn name(&self) -> &'static str {
        STORE_TYPE
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<&PlanfileMetadata>,
    ) -> Result<()> {
        let key = clean_key(key)?;
        // Build the bundle so format problems surface here, then report the
        // operation as unsupported: publishing an artifact goes through the
        // runner's toolkit (actions/upload-artifact), not the REST API.
        let bundle = bundle(data, metadata).map_err(|e| CiError::PlanfileUpload {
            key: key.clone(),
            source: e,
        })?;
        debug!(
            key,
            bundle_size = bundle.len(),
            retention_days = self.retention_days,
            "artifact bundle prepared; upload requires the Actions runner toolkit"
        );
        Err(CiError::OperationNotSupported {
            provider: STORE_TYPE.to_string(),
            operation: "artifact upload (use actions/upload-artifact in the workflow)".to_string(),
        })
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<PlanfileMetadata>)> {
        let key = clean_key(key)?;
        let name = artifact_name(&key);
        let artifact = self
            .find_artifact(&name)
            .await
            .map_err(|e| CiError::PlanfileDownload {
                key: key.clone(),
                source: e,
            })?
            .ok_or_else(|| CiError::PlanfileNotFound { key: key.clone() })?;

        let raw = self
            .download_bundle(&artifact)
            .await
            .map_err(|e| CiError::PlanfileDownload {
                key: key.clone(),
                source: e,
            })?;
        unbundle(&raw).map_err(|e| CiError::PlanfileDownload { key, source: e })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = clean_key(key)?;
        let name = artifact_name(&key);
        let artifact = match self.find_artifact(&name).await {
            Ok(Some(artifact)) => artifact,
            // Absent is success; delete is idempotent.
            Ok(None) => return Ok(()),
            Err(e) => {
                return Err(CiError::PlanfileDelete {
                    key,
                    source: e,
                })
            }
        };

        let url = format!("{}/{}", self.artifacts_url(), artifact.id);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| CiError::PlanfileDelete {
                key: key.clone(),
                source: e.into(),
            })?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(CiError::PlanfileDelete {
                key,
                source: anyhow::anyhow!("artifact delete returned {}", resp.status()),
            });
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = clean_key(key)?;
        let name = artifact_name(&key);
        self.find_artifact(&name)
            .await
            .map(|a| a.is_some())
            .map_err(|e| CiError::PlanfileStat { key, source: e })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<PlanfileInfo>> {
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            clean_key(prefix)?
        };

        let artifacts = self
            .fetch_all_artifacts()
            .await
            .map_err(|e| CiError::PlanfileList {
                prefix: prefix.clone(),
                source: e,
            })?;

        let mut entries: Vec<PlanfileInfo> = artifacts
            .into_iter()
            .filter(|a| !a.expired)
            .filter_map(|a| {
                let key = key_from_artifact_name(&a.name)?;
                if !prefix.is_empty() && !key.starts_with(&prefix) {
                    return None;
                }
                Some(PlanfileInfo {
                    key,
                    size: a.size_in_bytes,
                    last_modified: a.created_at,
                    metadata: None,
                })
            })
            .collect();

        sort_newest_first(&mut entries);
        Ok(entries)
    }

    async fn get_metadata(&self, key: &str) -> Result<PlanfileMetadata> {
        let key = clean_key(key)?;
        let name = artifact_name(&key);
        let artifact = self
            .find_artifact(&name)
            .await
            .map_err(|e| CiError::PlanfileStat {
                key: key.clone(),
                source: e,
            })?
            .ok_or_else(|| CiError::PlanfileNotFound { key: key.clone() })?;

        let raw = match self.download_bundle(&artifact).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "bundle fetch failed; returning minimal metadata");
                return Ok(PlanfileMetadata::minimal(artifact.created_at));
            }
        };
        match unbundle(&raw) {
            Ok((_, Some(meta))) => Ok(meta),
            Ok((_, None)) => Ok(PlanfileMetadata::minimal(artifact.created_at)),
            Err(e) => Err(CiError::PlanfileMetadata { key, source: e }),
        }
    }
}

/// `planfile-` + key with both separators flattened to `--`.
pub fn artifact_name(key: &str) -> String {
    let sanitized = key.replace(['/', '\\'], "--");
    format!("{ARTIFACT_PREFIX}{sanitized}")
}

/// Reverse of [`artifact_name`]; `None` for artifacts we did not create.
pub fn key_from_artifact_name(name: &str) -> Option<String> {
    name.strip_prefix(ARTIFACT_PREFIX)
        .map(|rest| rest.replace("--", "/"))
}

/// Zip the planfile and optional sidecar into an artifact bundle.
pub fn bundle(data: &[u8], metadata: Option<&PlanfileMetadata>) -> anyhow::Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        writer.start_file(BUNDLE_PLAN_ENTRY, options)?;
        writer.write_all(data)?;

        if let Some(metadata) = metadata {
            writer.start_file(BUNDLE_METADATA_ENTRY, options)?;
            writer.write_all(&serde_json::to_vec_pretty(metadata)?)?;
        }

        // Close before the buffer is consumed; the central directory is
        // written on finish.
        writer.finish()?;
    }
    Ok(cursor.into_inner())
}

/// Extract the planfile and optional sidecar from an artifact bundle.
pub fn unbundle(raw: &[u8]) -> anyhow::Result<(Vec<u8>, Option<PlanfileMetadata>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(raw))?;

    let mut data = Vec::new();
    archive
        .by_name(BUNDLE_PLAN_ENTRY)
        .map_err(|e| anyhow::anyhow!("bundle has no {BUNDLE_PLAN_ENTRY}: {e}"))?
        .read_to_end(&mut data)?;

    let metadata = match archive.by_name(BUNDLE_METADATA_ENTRY) {
        Ok(mut entry) => {
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            match serde_json::from_slice(&json) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!(error = %e, "ignoring unparseable bundle metadata");
                    None
                }
            }
        }
        Err(_) => None,
    };

    Ok((data, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_name_sanitizes_both_separators() {
        assert_eq!(
            artifact_name("dev/vpc/abc.tfplan"),
            "planfile-dev--vpc--abc.tfplan"
        );
        assert_eq!(artifact_name("dev\\vpc.tfplan"), "planfile-dev--vpc.tfplan");
    }

    #[test]
    fn key_recovery_round_trips() {
        let key = "plat-ue2-dev/vpc/abc123.tfplan";
        assert_eq!(
            key_from_artifact_name(&artifact_name(key)).unwrap(),
            key
        );
        assert_eq!(key_from_artifact_name("coverage-report"), None);
    }

    #[test]
    fn bundle_round_trips_content_and_metadata() {
        let meta = PlanfileMetadata {
            stack: "dev".into(),
            component: "vpc".into(),
            sha: "abc".into(),
            has_changes: true,
            ..Default::default()
        };
        let raw = bundle(b"the-plan", Some(&meta)).unwrap();
        let (data, loaded) = unbundle(&raw).unwrap();
        assert_eq!(data, b"the-plan");
        assert_eq!(loaded.unwrap(), meta);
    }

    #[test]
    fn bundle_without_metadata() {
        let raw = bundle(b"plan-only", None).unwrap();
        let (data, loaded) = unbundle(&raw).unwrap();
        assert_eq!(data, b"plan-only");
        assert!(loaded.is_none());
    }

    #[test]
    fn unbundle_rejects_foreign_archives() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("something-else.txt", options).unwrap();
            writer.write_all(b"nope").unwrap();
            writer.finish().unwrap();
        }
        let err = unbundle(&cursor.into_inner()).unwrap_err();
        assert!(err.to_string().contains(BUNDLE_PLAN_ENTRY));
    }

    #[test]
    fn token_resolution_prefers_explicit_option() {
        let opts = StoreOptions::new(STORE_TYPE).with("token", "ghp_explicit");
        assert_eq!(resolve_token(&opts).unwrap(), "ghp_explicit");
    }

    #[test]
    fn owner_repo_from_options() {
        let opts = StoreOptions::new(STORE_TYPE)
            .with("owner", "cloudposse")
            .with("repo", "infrastructure");
        let (owner, repo) = resolve_owner_repo(&opts).unwrap();
        assert_eq!(owner, "cloudposse");
        assert_eq!(repo, "infrastructure");
    }
}
