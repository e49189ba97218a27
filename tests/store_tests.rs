//! Store laws against the local backend, key-pattern laws, the environment
//! cascade, and retention pruning.

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;

use atmos_ci::store::key::{clean_key, generate_key, KeyContext, DEFAULT_KEY_PATTERN};
use atmos_ci::store::local::LocalStore;
use atmos_ci::store::{self, prune_expired, resolve_store_options};
use atmos_ci::{CiError, CiSettings, PlanfileMetadata, PlanfileStore};

/// Serializes tests that mutate process environment variables.
static ENV_LOCK: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

fn local_store() -> (tempfile::TempDir, LocalStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    (dir, store)
}

fn metadata(stack: &str) -> PlanfileMetadata {
    PlanfileMetadata {
        stack: stack.into(),
        component: "vpc".into(),
        sha: "abc123".into(),
        has_changes: true,
        additions: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn law_round_trip() {
    let (_dir, store) = local_store();
    let meta = metadata("dev");

    store
        .upload("dev/vpc/abc123.tfplan", b"round-trip-bytes", Some(&meta))
        .await
        .unwrap();
    let (data, loaded) = store.download("dev/vpc/abc123.tfplan").await.unwrap();
    assert_eq!(data, b"round-trip-bytes");
    assert_eq!(loaded.unwrap(), meta);
}

#[tokio::test]
async fn law_idempotent_delete() {
    let (_dir, store) = local_store();
    store.upload("dev/a.tfplan", b"x", None).await.unwrap();
    store.delete("dev/a.tfplan").await.unwrap();
    store.delete("dev/a.tfplan").await.unwrap();
    store.delete("never/was/here.tfplan").await.unwrap();
}

#[tokio::test]
async fn law_not_found_pairing() {
    let (_dir, store) = local_store();
    let err = store.download("dev/ghost.tfplan").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!store.exists("dev/ghost.tfplan").await.unwrap());
    assert!(store
        .get_metadata("dev/ghost.tfplan")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn law_listing_completeness_and_order() {
    let (_dir, store) = local_store();
    for (i, key) in ["p/one.tfplan", "p/two.tfplan", "p/sub/three.tfplan"]
        .iter()
        .enumerate()
    {
        store
            .upload(key, format!("{i}").as_bytes(), Some(&metadata("dev")))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    store.upload("other/x.tfplan", b"x", None).await.unwrap();

    let entries = store.list("p").await.unwrap();
    // Exactly the three uploads under the prefix, no sidecars.
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.key.starts_with("p/")));
    assert!(entries.iter().all(|e| !e.key.ends_with(".metadata.json")));
    // Newest first.
    assert_eq!(entries[0].key, "p/sub/three.tfplan");
    assert_eq!(entries[2].key, "p/one.tfplan");
}

#[tokio::test]
async fn law_path_traversal_makes_no_changes_outside_base() {
    let (dir, store) = local_store();
    let outside = dir.path().join("../traversal-canary");
    let _ = std::fs::remove_file(&outside);

    let err = store
        .upload("../traversal-canary", b"escaped", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CiError::KeyInvalid { .. }));
    assert!(!outside.exists());

    for key in ["../x", "a/../../b", "..\\win"] {
        assert!(matches!(
            store.download(key).await.unwrap_err(),
            CiError::KeyInvalid { .. }
        ));
        assert!(matches!(
            store.delete(key).await.unwrap_err(),
            CiError::KeyInvalid { .. }
        ));
        assert!(matches!(
            store.exists(key).await.unwrap_err(),
            CiError::KeyInvalid { .. }
        ));
        assert!(matches!(
            store.get_metadata(key).await.unwrap_err(),
            CiError::KeyInvalid { .. }
        ));
    }
}

#[test]
fn key_pattern_laws() {
    let ctx = KeyContext {
        stack: "plat-ue2-dev".into(),
        component: "vpc".into(),
        sha: String::new(),
        ext: "tfplan".into(),
        ..Default::default()
    };
    // Empty required placeholder fails.
    assert!(matches!(
        generate_key(DEFAULT_KEY_PATTERN, &ctx),
        Err(CiError::KeyInvalid { .. })
    ));

    // Optional placeholders substitute empty; unknown ones stay literal.
    let ctx = KeyContext {
        sha: "abc123".into(),
        ..ctx
    };
    assert_eq!(
        generate_key(DEFAULT_KEY_PATTERN, &ctx).unwrap(),
        "plat-ue2-dev/vpc/abc123.tfplan"
    );
    assert_eq!(
        generate_key("{stack}/{branch}{component}.{ext}", &ctx).unwrap(),
        "plat-ue2-dev/vpc.tfplan"
    );
    assert_eq!(
        generate_key("{stack}/{mystery}/{component}", &ctx).unwrap(),
        "plat-ue2-dev/{mystery}/vpc"
    );

    // Generated keys are traversal-safe by construction.
    assert!(clean_key(&generate_key(DEFAULT_KEY_PATTERN, &ctx).unwrap()).is_ok());
}

#[test]
fn cascade_prefers_config_then_env_then_local() {
    let _guard = ENV_LOCK.lock().unwrap();
    for var in [
        "ATMOS_PLANFILE_BUCKET",
        "ATMOS_PLANFILE_PREFIX",
        "AWS_REGION",
        "GITHUB_TOKEN",
        "GH_TOKEN",
        "GITHUB_REPOSITORY",
    ] {
        std::env::remove_var(var);
    }

    // 1. Config default wins outright.
    let settings =
        CiSettings::from_yaml("store:\n  type: s3\n  options:\n    bucket: from-config\n")
            .unwrap();
    let opts = resolve_store_options(&settings);
    assert_eq!(opts.store_type, "s3");
    assert_eq!(opts.get("bucket"), Some("from-config"));

    // 2. Object-store environment beats CI-artifact environment.
    std::env::set_var("ATMOS_PLANFILE_BUCKET", "b");
    std::env::set_var("ATMOS_PLANFILE_PREFIX", "atmos");
    std::env::set_var("AWS_REGION", "us-west-2");
    std::env::set_var("GITHUB_TOKEN", "ghp_test");
    std::env::set_var("GITHUB_REPOSITORY", "acme/infra");

    let opts = resolve_store_options(&CiSettings::default());
    assert_eq!(opts.store_type, "s3");
    assert_eq!(opts.get("bucket"), Some("b"));
    assert_eq!(opts.get("prefix"), Some("atmos"));
    assert_eq!(opts.get("region"), Some("us-west-2"));

    // 3. With no bucket, the CI-artifact store is next.
    std::env::remove_var("ATMOS_PLANFILE_BUCKET");
    let opts = resolve_store_options(&CiSettings::default());
    assert_eq!(opts.store_type, "github");
    assert_eq!(opts.get("owner"), Some("acme"));
    assert_eq!(opts.get("repo"), Some("infra"));

    // 4. Nothing configured: the conventional local path.
    std::env::remove_var("GITHUB_TOKEN");
    std::env::remove_var("GITHUB_REPOSITORY");
    let opts = resolve_store_options(&CiSettings::default());
    assert_eq!(opts.store_type, "local");
    assert_eq!(opts.get("path"), Some(store::DEFAULT_LOCAL_PATH));

    for var in ["ATMOS_PLANFILE_PREFIX", "AWS_REGION"] {
        std::env::remove_var(var);
    }
}

#[tokio::test]
async fn registry_constructs_local_store() {
    atmos_ci::register_builtins();
    let dir = tempfile::tempdir().unwrap();
    let opts = atmos_ci::StoreOptions::new("local").with("path", dir.path().display().to_string());
    let store = atmos_ci::create_store(&opts).await.unwrap();
    assert_eq!(store.name(), "local");
    store.upload("a/b.tfplan", b"x", None).await.unwrap();
    assert!(store.exists("a/b.tfplan").await.unwrap());

    let err = atmos_ci::create_store(&atmos_ci::StoreOptions::new("gcs"))
        .await
        .unwrap_err();
    assert!(matches!(err, CiError::StoreNotFound { .. }));
}

#[tokio::test]
async fn prune_removes_only_expired_entries() {
    let (_dir, store) = local_store();
    let now = Utc::now();

    let expired = PlanfileMetadata {
        expires_at: Some(now - Duration::days(1)),
        ..metadata("dev")
    };
    let fresh = PlanfileMetadata {
        expires_at: Some(now + Duration::days(6)),
        ..metadata("dev")
    };

    store
        .upload("dev/old.tfplan", b"old", Some(&expired))
        .await
        .unwrap();
    store
        .upload("dev/new.tfplan", b"new", Some(&fresh))
        .await
        .unwrap();
    store.upload("dev/no-meta.tfplan", b"keep", None).await.unwrap();

    let removed = prune_expired(&store, "dev", now).await.unwrap();
    assert_eq!(removed, 1);
    assert!(!store.exists("dev/old.tfplan").await.unwrap());
    assert!(store.exists("dev/new.tfplan").await.unwrap());
    assert!(store.exists("dev/no-meta.tfplan").await.unwrap());
}
