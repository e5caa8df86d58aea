//! Exercises the credential broker's `driver`-source provide/cleanup round
//! trip against a scratch directory, the way the Pod Mounter and Service
//! Mounter both invoke it ahead of a mount and a legacy unmount.

use csi_node_core::credentials::{self, AuthenticationSource, CleanupContext, MountKind, ProvideContext};

#[tokio::test]
async fn driver_source_materializes_and_cleans_up_profile_files() {
    std::env::set_var("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE00000000");
    std::env::set_var("AWS_SECRET_ACCESS_KEY", "exampleSecretKeyValueForTestingOnly0000");

    let dir = tempfile::tempdir().unwrap();
    let ctx = ProvideContext {
        write_dir: dir.path().to_path_buf(),
        view_dir: dir.path().to_path_buf(),
        pod_uid: "pod-abc".to_string(),
        volume_id: "vol-123".to_string(),
        auth_source: AuthenticationSource::Driver,
        ..Default::default()
    };

    let (env, source) = credentials::provide(&ctx, None).await.unwrap();
    assert_eq!(source, AuthenticationSource::Driver);
    assert!(env.get("AWS_SHARED_CREDENTIALS_FILE").is_some());

    let prefix = "pod-abc-vol-123";
    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(entries.iter().any(|n| n.starts_with(prefix)), "expected credential files under prefix {prefix}, found {entries:?}");

    let cleanup_ctx = CleanupContext {
        write_dir: dir.path().to_path_buf(),
        pod_uid: "pod-abc".to_string(),
        volume_id: "vol-123".to_string(),
        mount_kind: MountKind::Pod,
    };
    credentials::cleanup(&cleanup_ctx).unwrap();

    let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).collect();
    assert!(remaining.is_empty(), "cleanup should remove every file it wrote");

    std::env::remove_var("AWS_ACCESS_KEY_ID");
    std::env::remove_var("AWS_SECRET_ACCESS_KEY");
}
