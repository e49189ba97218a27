//! Filesystem-backed planfile store.
//!
//! Planfiles live at `<base>/<key>` with sidecar metadata at
//! `<base>/<key>.metadata.json` (indented JSON). Uploads are staged to a
//! `.partial` sibling and renamed into place so readers only ever see the old
//! object or the fully written new one. Deletes clean up empty parent
//! directories, walking upward until the base or the first non-empty
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CiError, Result};
use crate::store::key::clean_key;
use crate::store::{
    sort_newest_first, PlanfileInfo, PlanfileMetadata, PlanfileStore, StoreFactory, StoreOptions,
    METADATA_SUFFIX,
};

pub const STORE_TYPE: &str = "local";

/// Registry factory for `local` stores. `path` defaults to the conventional
/// location when unset.
pub fn factory(opts: &StoreOptions) -> BoxFuture<'_, Result<Arc<dyn PlanfileStore>>> {
    Box::pin(async move {
        let path = opts.get("path").unwrap_or(crate::store::DEFAULT_LOCAL_PATH);
        Ok(Arc::new(LocalStore::new(path)?) as Arc<dyn PlanfileStore>)
    })
}

// Yes, this matches StoreFactory.
const _: StoreFactory = factory;

#[derive(Debug)]
pub struct LocalStore {
    base: PathBuf,
    /// Serializes destructive steps (rename-into-place, delete + parent
    /// cleanup) within this process.
    destructive: Mutex<()>,
}

impl LocalStore {
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            base: expand_tilde(base.as_ref()),
            destructive: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.base.join(clean_key(key)?))
    }

    fn sidecar_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.object_path(key)?.into_os_string();
        path.push(METADATA_SUFFIX);
        Ok(PathBuf::from(path))
    }

    async fn read_sidecar(&self, key: &str) -> Option<PlanfileMetadata> {
        let path = self.sidecar_path(key).ok()?;
        let raw = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(key, error = %e, "ignoring unparseable sidecar metadata");
                None
            }
        }
    }

    /// Remove now-empty directories above `path`, stopping at the base or the
    /// first directory that still has entries.
    fn cleanup_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.base || !dir.starts_with(&self.base) {
                break;
            }
            match std::fs::read_dir(dir) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(_) => break,
            }
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl PlanfileStore for LocalStore {
    fn name(&self) -> &'static str {
        STORE_TYPE
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<&PlanfileMetadata>,
    ) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CiError::PlanfileUpload {
                    key: key.to_string(),
                    source: anyhow::Error::new(e).context("creating parent directories"),
                })?;
        }

        // Stage then rename so a concurrent reader never sees a torn write.
        let staging = {
            let mut staged = path.clone().into_os_string();
            staged.push(".partial");
            PathBuf::from(staged)
        };
        tokio::fs::write(&staging, data)
            .await
            .map_err(|e| CiError::PlanfileUpload {
                key: key.to_string(),
                source: e.into(),
            })?;

        {
            let _guard = self.destructive.lock().await;
            tokio::fs::rename(&staging, &path)
                .await
                .map_err(|e| CiError::PlanfileUpload {
                    key: key.to_string(),
                    source: e.into(),
                })?;
        }
        debug!(key, path = %path.display(), "planfile written");

        if let Some(metadata) = metadata {
            let sidecar = self.sidecar_path(key)?;
            let json = serde_json::to_vec_pretty(metadata).map_err(|e| {
                CiError::PlanfileMetadata {
                    key: key.to_string(),
                    source: e.into(),
                }
            })?;
            if let Err(e) = tokio::fs::write(&sidecar, json).await {
                // Primary object landed; a sidecar failure is not fatal.
                warn!(key, error = %e, "sidecar metadata write failed");
            }
        }

        Ok(())
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<PlanfileMetadata>)> {
        let path = self.object_path(key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CiError::PlanfileNotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => {
                return Err(CiError::PlanfileDownload {
                    key: key.to_string(),
                    source: e.into(),
                })
            }
        };
        Ok((data, self.read_sidecar(key).await))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        let sidecar = self.sidecar_path(key)?;

        let _guard = self.destructive.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CiError::PlanfileDelete {
                    key: key.to_string(),
                    source: e.into(),
                })
            }
        }
        if let Err(e) = tokio::fs::remove_file(&sidecar).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key, error = %e, "sidecar delete failed");
            }
        }
        self.cleanup_empty_parents(&path);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CiError::PlanfileStat {
                key: key.to_string(),
                source: e.into(),
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<PlanfileInfo>> {
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            clean_key(prefix)?
        };

        if !self.base.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        // Unreadable subtrees are skipped, not fatal.
        for entry in WalkDir::new(&self.base).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.base) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.ends_with(METADATA_SUFFIX) || key.ends_with(".partial") {
                continue;
            }
            if !prefix.is_empty() && !key.starts_with(&prefix) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let last_modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(PlanfileInfo {
                key,
                size: meta.len(),
                last_modified,
                metadata: None,
            });
        }

        sort_newest_first(&mut entries);
        Ok(entries)
    }

    async fn get_metadata(&self, key: &str) -> Result<PlanfileMetadata> {
        let path = self.object_path(key)?;
        let stat = match tokio::fs::metadata(&path).await {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CiError::PlanfileNotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => {
                return Err(CiError::PlanfileStat {
                    key: key.to_string(),
                    source: e.into(),
                })
            }
        };

        match self.read_sidecar(key).await {
            Some(meta) => Ok(meta),
            None => {
                let modified = stat
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(PlanfileMetadata::minimal(modified))
            }
        }
    }
}

/// Resolve a leading `~` against the current user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn meta() -> PlanfileMetadata {
        PlanfileMetadata {
            stack: "plat-ue2-dev".into(),
            component: "vpc".into(),
            sha: "abc123".into(),
            has_changes: true,
            additions: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upload_download_round_trip() {
        let (_dir, store) = store();
        let m = meta();
        store
            .upload("dev/vpc/abc.tfplan", b"plan-bytes", Some(&m))
            .await
            .unwrap();

        let (data, loaded) = store.download("dev/vpc/abc.tfplan").await.unwrap();
        assert_eq!(data, b"plan-bytes");
        assert_eq!(loaded.unwrap(), m);
    }

    #[tokio::test]
    async fn sidecar_is_indented_json() {
        let (dir, store) = store();
        store
            .upload("dev/vpc.tfplan", b"x", Some(&meta()))
            .await
            .unwrap();
        let raw =
            std::fs::read_to_string(dir.path().join("dev/vpc.tfplan.metadata.json")).unwrap();
        assert!(raw.contains("\n  \"stack\""));
    }

    #[tokio::test]
    async fn download_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store.download("dev/absent.tfplan").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists("dev/absent.tfplan").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_cleans_parents() {
        let (dir, store) = store();
        store
            .upload("a/b/c/plan.tfplan", b"x", Some(&meta()))
            .await
            .unwrap();
        store.delete("a/b/c/plan.tfplan").await.unwrap();
        store.delete("a/b/c/plan.tfplan").await.unwrap();

        // Empty parents are gone, base remains.
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn delete_stops_at_non_empty_parent() {
        let (dir, store) = store();
        store.upload("a/b/one.tfplan", b"1", None).await.unwrap();
        store.upload("a/two.tfplan", b"2", None).await.unwrap();

        store.delete("a/b/one.tfplan").await.unwrap();
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a/two.tfplan").exists());
    }

    #[tokio::test]
    async fn list_excludes_sidecars_and_sorts() {
        let (_dir, store) = store();
        store
            .upload("dev/vpc/a.tfplan", b"a", Some(&meta()))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store
            .upload("dev/vpc/b.tfplan", b"bb", Some(&meta()))
            .await
            .unwrap();
        store.upload("prod/vpc/c.tfplan", b"c", None).await.unwrap();

        let entries = store.list("dev").await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["dev/vpc/b.tfplan", "dev/vpc/a.tfplan"]);
        assert_eq!(entries[0].size, 2);

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn traversal_is_rejected_everywhere() {
        let (_dir, store) = store();
        let key = "../../etc/passwd";
        assert!(matches!(
            store.upload(key, b"x", None).await,
            Err(CiError::KeyInvalid { .. })
        ));
        assert!(matches!(
            store.download(key).await,
            Err(CiError::KeyInvalid { .. })
        ));
        assert!(matches!(
            store.delete(key).await,
            Err(CiError::KeyInvalid { .. })
        ));
        assert!(matches!(
            store.exists(key).await,
            Err(CiError::KeyInvalid { .. })
        ));
        assert!(matches!(
            store.get_metadata(key).await,
            Err(CiError::KeyInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn get_metadata_minimal_when_sidecar_missing() {
        let (_dir, store) = store();
        store.upload("dev/plain.tfplan", b"x", None).await.unwrap();
        let meta = store.get_metadata("dev/plain.tfplan").await.unwrap();
        assert!(meta.stack.is_empty());

        let err = store.get_metadata("dev/none.tfplan").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_tilde(Path::new("~/planfiles")),
                home.join("planfiles")
            );
            assert_eq!(expand_tilde(Path::new("~")), home);
        }
        assert_eq!(
            expand_tilde(Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
    }
}
