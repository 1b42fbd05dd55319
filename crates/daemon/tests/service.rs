use std::sync::Arc;
use std::time::Duration;

use common::prelude::{MemoryBackend, UserType};
use nfsrods::vfs::{StaticIdentitySource, VfsError};
use nfsrods::{start_service, AppConfig, ServiceConfig};

fn service_config(app: AppConfig) -> ServiceConfig {
    ServiceConfig {
        app,
        log_level: tracing::Level::DEBUG,
        log_dir: None,
    }
}

#[tokio::test]
async fn test_service_starts_and_shuts_down() {
    let backend = MemoryBackend::new("tempZone", "rods");
    backend.add_user("alice", UserType::Regular);
    let identities = Arc::new(StaticIdentitySource::new().with_user("alice", 1000, 1000));

    let config = service_config(AppConfig::default());
    let (vfs, handle) = start_service(&config, Arc::new(backend.clone()), identities)
        .await
        .unwrap();

    let root = vfs.root_handle();
    let alice_home = vfs.lookup(1000, root, "alice").await.unwrap();
    let attrs = vfs.getattr(1000, alice_home).await.unwrap();
    assert_eq!(attrs.uid, 1000);
    assert_eq!(vfs.parent_of(alice_home).unwrap(), root);

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_service_rejects_missing_mount_point() {
    let backend = MemoryBackend::new("tempZone", "rods");
    let mut app = AppConfig::default();
    app.nfs_server.backend_mount_point = "/tempZone/home/nobody".into();

    let result = start_service(
        &service_config(app),
        Arc::new(backend),
        Arc::new(StaticIdentitySource::new()),
    )
    .await;
    assert!(matches!(
        result,
        Err(nfsrods::process::ServiceError::Vfs(VfsError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_service_rejects_zero_refresh_interval() {
    let backend = MemoryBackend::new("tempZone", "rods");
    let mut app = AppConfig::default();
    app.nfs_server.allowlist_refresh_time_in_milliseconds = 0;

    let result = start_service(
        &service_config(app),
        Arc::new(backend.clone()),
        Arc::new(StaticIdentitySource::new()),
    )
    .await;
    assert!(matches!(
        result,
        Err(nfsrods::process::ServiceError::Config(_))
    ));
    assert_eq!(backend.connect_count(), 0);
}
