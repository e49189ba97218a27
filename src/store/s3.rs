//! S3-compatible planfile store.
//!
//! Objects live at `<prefix>/<key>` (forward slashes regardless of host OS)
//! with sidecar metadata at `<prefix>/<key>.metadata.json`, content type
//! `application/json`. A custom `endpoint` option supports S3-compatible
//! services (MinIO, R2, Spaces).

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::{CiError, Result};
use crate::store::key::clean_key;
use crate::store::{
    sort_newest_first, PlanfileInfo, PlanfileMetadata, PlanfileStore, StoreFactory, StoreOptions,
    METADATA_SUFFIX,
};

pub const STORE_TYPE: &str = "s3";

const DEFAULT_REGION: &str = "us-east-1";

/// Registry factory for `s3` stores. Requires `bucket`; honors `prefix`,
/// `region`, and `endpoint`.
pub fn factory(opts: &StoreOptions) -> BoxFuture<'_, Result<Arc<dyn PlanfileStore>>> {
    Box::pin(async move {
        let bucket = opts.require("bucket")?.to_string();
        let prefix = opts.get("prefix").unwrap_or("").to_string();
        let region = opts
            .get("region")
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region));
        if let Some(endpoint) = opts.get("endpoint") {
            loader = loader.endpoint_url(endpoint.to_string());
        }
        let sdk_config = loader.load().await;

        Ok(Arc::new(S3Store::new(Client::new(&sdk_config), bucket, prefix))
            as Arc<dyn PlanfileStore>)
    })
}

const _: StoreFactory = factory;

#[derive(Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: normalize_prefix(&prefix.into()),
        }
    }

    fn object_key(&self, key: &str) -> Result<String> {
        Ok(join_prefix(&self.prefix, &clean_key(key)?))
    }

    fn sidecar_key(&self, key: &str) -> Result<String> {
        Ok(format!("{}{METADATA_SUFFIX}", self.object_key(key)?))
    }

    async fn read_sidecar(&self, key: &str) -> Option<PlanfileMetadata> {
        let sidecar = self.sidecar_key(key).ok()?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&sidecar)
            .send()
            .await
            .ok()?;
        let bytes = resp.body.collect().await.ok()?.into_bytes();
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(key, error = %e, "ignoring unparseable sidecar metadata");
                None
            }
        }
    }
}

#[async_trait]
impl PlanfileStore for S3Store {
    fn name(&self) -> &'static str {
        STORE_TYPE
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<&PlanfileMetadata>,
    ) -> Result<()> {
        let object_key = self.object_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| CiError::PlanfileUpload {
                key: key.to_string(),
                source: e.into(),
            })?;
        debug!(key, bucket = %self.bucket, "planfile uploaded");

        if let Some(metadata) = metadata {
            let json = serde_json::to_vec_pretty(metadata).map_err(|e| {
                CiError::PlanfileMetadata {
                    key: key.to_string(),
                    source: e.into(),
                }
            })?;
            let sidecar = self.sidecar_key(key)?;
            if let Err(e) = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&sidecar)
                .content_type("application/json")
                .body(ByteStream::from(json))
                .send()
                .await
            {
                warn!(key, error = %e, "sidecar metadata upload failed");
            }
        }

        Ok(())
    }

    async fn download(&self, key: &str) -> Result<(Vec<u8>, Option<PlanfileMetadata>)> {
        let object_key = self.object_key(key)?;
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                if e.as_service_error().map(|s| s.is_no_such_key()) == Some(true) {
                    return Err(CiError::PlanfileNotFound {
                        key: key.to_string(),
                    });
                }
                return Err(CiError::PlanfileDownload {
                    key: key.to_string(),
                    source: e.into(),
                });
            }
        };

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| CiError::PlanfileDownload {
                key: key.to_string(),
                source: e.into(),
            })?
            .into_bytes()
            .to_vec();

        Ok((data, self.read_sidecar(key).await))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let object_key = self.object_key(key)?;
        // S3 delete is idempotent; absent objects succeed.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| CiError::PlanfileDelete {
                key: key.to_string(),
                source: e.into(),
            })?;

        let sidecar = self.sidecar_key(key)?;
        if let Err(e) = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&sidecar)
            .send()
            .await
        {
            warn!(key, error = %e, "sidecar delete failed");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let object_key = self.object_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|s| s.is_not_found()) == Some(true) {
                    Ok(false)
                } else {
                    Err(CiError::PlanfileStat {
                        key: key.to_string(),
                        source: e.into(),
                    })
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<PlanfileInfo>> {
        let listing_prefix = if prefix.is_empty() {
            self.prefix.clone()
        } else {
            join_prefix(&self.prefix, &clean_key(prefix)?)
        };

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&listing_prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.map_err(|e| CiError::PlanfileList {
                prefix: prefix.to_string(),
                source: e.into(),
            })?;

            for object in resp.contents() {
                let Some(full_key) = object.key() else { continue };
                if full_key.ends_with(METADATA_SUFFIX) {
                    continue;
                }
                let key = strip_prefix(&self.prefix, full_key);
                let last_modified = object
                    .last_modified()
                    .and_then(aws_datetime_to_chrono)
                    .unwrap_or_else(Utc::now);
                entries.push(PlanfileInfo {
                    key,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                    metadata: None,
                });
            }

            continuation = resp
                .next_continuation_token()
                .map(str::to_string)
                .filter(|_| resp.is_truncated() == Some(true));
            if continuation.is_none() {
                break;
            }
        }

        sort_newest_first(&mut entries);
        Ok(entries)
    }

    async fn get_metadata(&self, key: &str) -> Result<PlanfileMetadata> {
        let object_key = self.object_key(key)?;
        let head = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(e) => {
                if e.as_service_error().map(|s| s.is_not_found()) == Some(true) {
                    return Err(CiError::PlanfileNotFound {
                        key: key.to_string(),
                    });
                }
                return Err(CiError::PlanfileStat {
                    key: key.to_string(),
                    source: e.into(),
                });
            }
        };

        match self.read_sidecar(key).await {
            Some(meta) => Ok(meta),
            None => {
                let created_at = head
                    .last_modified()
                    .and_then(aws_datetime_to_chrono)
                    .unwrap_or_else(Utc::now);
                Ok(PlanfileMetadata::minimal(created_at))
            }
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

/// Join with forward slashes irrespective of host OS.
fn join_prefix(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

fn strip_prefix(prefix: &str, full_key: &str) -> String {
    if prefix.is_empty() {
        return full_key.to_string();
    }
    full_key
        .strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(full_key)
        .to_string()
}

fn aws_datetime_to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_joining_uses_forward_slashes() {
        assert_eq!(join_prefix("atmos", "dev/vpc.tfplan"), "atmos/dev/vpc.tfplan");
        assert_eq!(join_prefix("", "dev/vpc.tfplan"), "dev/vpc.tfplan");
        assert_eq!(normalize_prefix("/atmos/planfiles/"), "atmos/planfiles");
    }

    #[test]
    fn strip_prefix_recovers_keys() {
        assert_eq!(strip_prefix("atmos", "atmos/dev/vpc.tfplan"), "dev/vpc.tfplan");
        assert_eq!(strip_prefix("", "dev/vpc.tfplan"), "dev/vpc.tfplan");
        // Foreign keys are passed through untouched.
        assert_eq!(strip_prefix("atmos", "other/key"), "other/key");
    }

    #[test]
    fn aws_datetime_conversion() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_750_000_000);
        let chrono_dt = aws_datetime_to_chrono(&dt).unwrap();
        assert_eq!(chrono_dt.timestamp(), 1_750_000_000);
    }

    #[test]
    fn factory_requires_bucket() {
        let opts = StoreOptions::new(STORE_TYPE);
        let err = futures::executor::block_on(factory(&opts)).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }
}
