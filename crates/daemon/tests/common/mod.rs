//! Shared fixtures for adapter integration tests
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use ::common::prelude::{Account, Backend, MemoryBackend, UserType};
use nfsrods::vfs::{
    AclAllowlist, CacheTtls, IdMapper, NfsVfs, StaticIdentitySource, VfsOptions,
    DEFAULT_ALLOWLIST_ATTRIBUTE,
};

pub const ADMIN: u32 = 0;
pub const ALICE: u32 = 1000;
pub const BOB: u32 = 1001;
pub const CAROL: u32 = 1002;
pub const LAB_GID: u32 = 2000;

pub const ZONE: &str = "tempZone";
pub const MOUNT_POINT: &str = "/tempZone/home/alice";

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;

pub struct TestEnv {
    pub vfs: NfsVfs,
    pub backend: MemoryBackend,
    pub identities: Arc<StaticIdentitySource>,
    pub ids: Arc<IdMapper>,
    pub allowlist: Arc<AclAllowlist>,
}

pub fn admin_account() -> Account {
    Account {
        host: "localhost".into(),
        port: 1247,
        zone: ZONE.into(),
        default_resource: "demoResc".into(),
        proxy_user: "rods".into(),
        proxy_password: "rods".into(),
        client_user: "rods".into(),
        home: PathBuf::from("/tempZone/home"),
    }
}

/// Proxied account acting as `user`
pub fn account(user: &str) -> Account {
    admin_account().acting_as(user)
}

pub fn default_options() -> VfsOptions {
    VfsOptions {
        mount_point: PathBuf::from(MOUNT_POINT),
        zone: ZONE.to_string(),
        allow_overwrite: true,
        ttls: CacheTtls::default(),
    }
}

/// Backend path of `name` below the mount point
pub fn path(name: &str) -> PathBuf {
    PathBuf::from(MOUNT_POINT).join(name)
}

/// alice, bob and carol with home collections, bob in group `lab`, and
///  the adapter exporting alice's home.
pub async fn setup_test_env() -> TestEnv {
    setup_test_env_with(default_options()).await
}

pub async fn setup_test_env_with(options: VfsOptions) -> TestEnv {
    let backend = MemoryBackend::new(ZONE, "rods");
    backend.add_user("alice", UserType::Regular);
    backend.add_user("bob", UserType::Regular);
    backend.add_user("carol", UserType::Regular);
    backend.add_group("lab", &["bob"]);

    let identities = Arc::new(
        StaticIdentitySource::new()
            .with_user("alice", ALICE, ALICE)
            .with_user("bob", BOB, BOB)
            .with_user("carol", CAROL, CAROL)
            .with_group("lab", LAB_GID),
    );

    let shared: Arc<dyn Backend> = Arc::new(backend.clone());
    let ids = Arc::new(IdMapper::new(
        shared.clone(),
        identities.clone(),
        admin_account(),
    ));
    let allowlist = Arc::new(AclAllowlist::new(
        shared.clone(),
        admin_account(),
        DEFAULT_ALLOWLIST_ATTRIBUTE,
    ));
    let vfs = NfsVfs::new(shared, ids.clone(), allowlist.clone(), options)
        .await
        .unwrap();

    TestEnv {
        vfs,
        backend,
        identities,
        ids,
        allowlist,
    }
}
