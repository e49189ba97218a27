//! Planfile store abstraction.
//!
//! A store is a key-addressed blob store with sidecar metadata. Three
//! backends ship in this crate:
//!
//! | Type | Backing | Module |
//! |--------|---------------------------------|-----------|
//! | `local` | filesystem under a base path | [`local`] |
//! | `s3` | S3-compatible object store | [`s3`] |
//! | `github` | GitHub Actions artifacts | [`github_artifact`] |
//!
//! Stores are cheap to construct and are built per request from
//! [`StoreOptions`] through the name-keyed factory registry. The engine picks
//! options through a cascade: the tool config's `ci.store` block, then
//! environment detection (object-store variables win over CI-artifact
//! variables), then a local default.
//!
//! Every backend funnels keys through [`key::clean_key`], so traversal is
//! rejected uniformly across methods.

pub mod github_artifact;
pub mod key;
pub mod local;
pub mod s3;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{CiSettings, StoreSettings};
use crate::error::{CiError, Result};

/// Default retention for provider-hosted artifacts, in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Conventional base path for the local fallback store.
pub const DEFAULT_LOCAL_PATH: &str = ".atmos/planfiles";

/// Sidecar metadata persisted next to each planfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanfileMetadata {
    pub stack: String,
    pub component: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub component_path: String,
    pub sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<String>,
    pub has_changes: bool,
    pub additions: u64,
    pub changes: u64,
    pub destructions: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl Default for PlanfileMetadata {
    fn default() -> Self {
        Self {
            stack: String::new(),
            component: String::new(),
            component_path: String::new(),
            sha: String::new(),
            base_sha: None,
            branch: None,
            pr_number: None,
            run_id: None,
            repository: None,
            created_at: Utc::now(),
            expires_at: None,
            plan_summary: None,
            has_changes: false,
            additions: 0,
            changes: 0,
            destructions: 0,
            custom: BTreeMap::new(),
        }
    }
}

impl PlanfileMetadata {
    /// The stand-in returned when the primary object exists but its sidecar
    /// is missing or unreadable.
    pub fn minimal(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            ..Default::default()
        }
    }
}

/// One entry in a store listing.
#[derive(Debug, Clone)]
pub struct PlanfileInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub metadata: Option<PlanfileMetadata>,
}

/// Sort listing entries newest-first, the order every backend returns.
pub fn sort_newest_first(entries: &mut [PlanfileInfo]) {
    entries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
}

/// Suffix of sidecar objects; excluded from listings.
pub const METADATA_SUFFIX: &str = ".metadata.json";

/// Normalized store construction options.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub store_type: String,
    pub options: BTreeMap<String, String>,
}

impl StoreOptions {
    pub fn new(store_type: impl Into<String>) -> Self {
        Self {
            store_type: store_type.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self {
            store_type: settings.store_type.clone(),
            options: settings.string_options(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Required string option; missing or empty is a config error.
    pub fn require(&self, name: &str) -> Result<&str> {
        match self.get(name) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(CiError::InvalidConfig(format!(
                "store '{}' requires option '{name}'",
                self.store_type
            ))),
        }
    }

    pub fn get_u32(&self, name: &str) -> Result<Option<u32>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                CiError::InvalidConfig(format!(
                    "store '{}' option '{name}' must be an integer, got '{raw}'",
                    self.store_type
                ))
            }),
        }
    }
}

/// The store contract every backend satisfies.
#[async_trait]
pub trait PlanfileStore: Send + Sync + std::fmt::Debug {
    /// Store-type tag (`local`, `s3`, `github`).
    fn name(&self) -> &'static str;

    /// Write the planfile and, best-effort, its sidecar metadata. Never
    /// returns success if the primary write failed.
    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<&PlanfileMetadata>,
    ) -> Result<()>;

    /// Fetch the planfile plus its sidecar if one exists.
    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<PlanfileMetadata>)>;

    /// Idempotent delete; deleting an absent object succeeds. The sidecar is
    /// removed best-effort afterwards.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Recursive listing under `prefix`, sidecars excluded, newest first.
    async fn list(&self, prefix: &str) -> Result<Vec<PlanfileInfo>>;

    /// Sidecar metadata for `key`. Not-found when the primary is absent; a
    /// minimal metadata (created_at = last modified) when only the sidecar is.
    async fn get_metadata(&self, key: &str) -> Result<PlanfileMetadata>;
}

// ---------------------------------------------------------------------------
// Factory registry
// ---------------------------------------------------------------------------

/// Store constructor. Async because some backends load cloud configuration.
pub type StoreFactory =
    for<'a> fn(&'a StoreOptions) -> BoxFuture<'a, Result<Arc<dyn PlanfileStore>>>;

static REGISTRY: Lazy<RwLock<HashMap<String, StoreFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a store factory under a type name. Duplicate names fail.
pub fn register_store(name: &str, factory: StoreFactory) -> Result<()> {
    let mut registry = REGISTRY.write().expect("store registry poisoned");
    if registry.contains_key(name) {
        return Err(CiError::InvalidConfig(format!(
            "store type '{name}' is already registered"
        )));
    }
    registry.insert(name.to_string(), factory);
    Ok(())
}

/// Construct a store from options via the registry.
pub async fn create_store(opts: &StoreOptions) -> Result<Arc<dyn PlanfileStore>> {
    let factory = {
        let registry = REGISTRY.read().expect("store registry poisoned");
        registry.get(&opts.store_type).copied()
    };
    match factory {
        Some(factory) => factory(opts).await,
        None => Err(CiError::StoreNotFound {
            name: opts.store_type.clone(),
        }),
    }
}

/// Register the built-in backends. Called from [`crate::register_builtins`].
pub(crate) fn register_builtin_stores() {
    // Duplicate registration can only mean register_builtins ran twice.
    let _ = register_store(local::STORE_TYPE, local::factory);
    let _ = register_store(s3::STORE_TYPE, s3::factory);
    let _ = register_store(github_artifact::STORE_TYPE, github_artifact::factory);
}

// ---------------------------------------------------------------------------
// Store cascade
// ---------------------------------------------------------------------------

/// Resolve store options for the engine's upload/download actions:
/// config default, then environment detection, then the local fallback.
pub fn resolve_store_options(settings: &CiSettings) -> StoreOptions {
    if let Some(store) = &settings.store {
        if !store.store_type.is_empty() {
            return StoreOptions::from_settings(store);
        }
    }

    // Object-store variables take priority over CI-artifact variables.
    if let Ok(bucket) = std::env::var("ATMOS_PLANFILE_BUCKET") {
        if !bucket.is_empty() {
            let mut opts = StoreOptions::new(s3::STORE_TYPE).with("bucket", bucket);
            if let Ok(prefix) = std::env::var("ATMOS_PLANFILE_PREFIX") {
                opts = opts.with("prefix", prefix);
            }
            if let Ok(region) = std::env::var("AWS_REGION") {
                opts = opts.with("region", region);
            }
            return opts;
        }
    }

    let has_token = std::env::var("GITHUB_TOKEN")
        .or_else(|_| std::env::var("GH_TOKEN"))
        .map(|t| !t.is_empty())
        .unwrap_or(false);
    if has_token {
        if let Ok(repository) = std::env::var("GITHUB_REPOSITORY") {
            if let Some((owner, repo)) = repository.split_once('/') {
                return StoreOptions::new(github_artifact::STORE_TYPE)
                    .with("owner", owner)
                    .with("repo", repo);
            }
        }
    }

    StoreOptions::new(local::STORE_TYPE).with("path", DEFAULT_LOCAL_PATH)
}

/// Construct the store the engine should use for this configuration.
pub async fn create_planfile_store(settings: &CiSettings) -> Result<Arc<dyn PlanfileStore>> {
    create_store(&resolve_store_options(settings)).await
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Delete artifacts under `prefix` whose metadata says they expired before
/// `now`. Entries without metadata are left alone. Returns the number of
/// deleted planfiles.
pub async fn prune_expired(
    store: &dyn PlanfileStore,
    prefix: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let entries = store.list(prefix).await?;
    let mut removed = 0;

    for entry in entries {
        let metadata = match &entry.metadata {
            Some(m) => m.clone(),
            None => match store.get_metadata(&entry.key).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping unreadable metadata during prune");
                    continue;
                }
            },
        };
        let Some(expires_at) = metadata.expires_at else {
            continue;
        };
        if expires_at < now {
            match store.delete(&entry.key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(key = %entry.key, error = %e, "prune delete failed"),
            }
        }
    }

    Ok(removed)
}
