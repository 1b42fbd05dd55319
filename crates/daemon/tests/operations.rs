mod common;

use std::path::Path;

use ::common::prelude::SessionGuard;
use nfsrods::vfs::{FileType, SetAttributes, Stability, VfsError};

use crate::common::{
    admin_account, setup_test_env, setup_test_env_with, ALICE, BOB, MOUNT_POINT, S_IFDIR, S_IFMT,
    S_IFREG,
};

#[tokio::test]
async fn test_mkdir_lookup_getattr() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();

    let dir = env.vfs.mkdir(ALICE, root, "a", 0o755).await.unwrap();
    assert_ne!(dir, root);
    assert_eq!(env.vfs.lookup(ALICE, root, "a").await.unwrap(), dir);

    let attrs = env.vfs.getattr(ALICE, dir).await.unwrap();
    assert_eq!(attrs.mode & S_IFMT, S_IFDIR);
    assert_eq!(attrs.mode & 0o777, 0o700);
    assert_eq!(attrs.handle, dir);
    assert_eq!(attrs.uid, ALICE);
    assert_eq!(attrs.nlink, 2);
}

#[tokio::test]
async fn test_create_write_read() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();

    let file = env
        .vfs
        .create(ALICE, root, "f.txt", FileType::Regular, 0o644)
        .await
        .unwrap();
    let (written, stability) = env
        .vfs
        .write(ALICE, file, 0, b"hello", Stability::Unstable)
        .await
        .unwrap();
    assert_eq!(written, 5);
    assert_eq!(stability, Stability::FileSync);

    assert_eq!(env.vfs.read(ALICE, file, 0, 5).await.unwrap(), b"hello");
    assert_eq!(env.vfs.read(ALICE, file, 1, 100).await.unwrap(), b"ello");
    assert!(env.vfs.read(ALICE, file, 10, 5).await.unwrap().is_empty());

    let attrs = env.vfs.getattr(ALICE, file).await.unwrap();
    assert_eq!(attrs.mode & S_IFMT, S_IFREG);
    assert_eq!(attrs.mode & 0o111, 0);
    assert_eq!(attrs.size, 5);
}

#[tokio::test]
async fn test_rename_keeps_handle() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();

    let dir = env.vfs.mkdir(ALICE, root, "a", 0o755).await.unwrap();
    env.vfs.rename(ALICE, root, "a", root, "b").await.unwrap();

    let err = env.vfs.lookup(ALICE, root, "a").await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
    assert_eq!(env.vfs.lookup(ALICE, root, "b").await.unwrap(), dir);
    assert_eq!(env.vfs.inodes().path_of(dir), Some(common::path("b")));
}

#[tokio::test]
async fn test_write_invalidates_attributes_for_every_user() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let file = env
        .vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap();

    assert_eq!(env.vfs.getattr(ALICE, file).await.unwrap().size, 0);
    assert_eq!(env.vfs.getattr(BOB, file).await.unwrap().size, 0);

    env.vfs
        .write(ALICE, file, 0, b"12345", Stability::FileSync)
        .await
        .unwrap();
    assert_eq!(env.vfs.getattr(ALICE, file).await.unwrap().size, 5);
    assert_eq!(env.vfs.getattr(BOB, file).await.unwrap().size, 5);
}

#[tokio::test]
async fn test_create_overwrites_when_allowed() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let file = env
        .vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap();
    env.vfs
        .write(ALICE, file, 0, b"stale", Stability::FileSync)
        .await
        .unwrap();

    let again = env
        .vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap();
    assert_eq!(again, file);
    assert_eq!(env.vfs.getattr(ALICE, file).await.unwrap().size, 0);
}

#[tokio::test]
async fn test_create_rejects_existing_without_overwrite() {
    let options = nfsrods::vfs::VfsOptions {
        allow_overwrite: false,
        ..common::default_options()
    };
    let env = setup_test_env_with(options).await;
    let root = env.vfs.root_handle();
    env.vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap();

    let err = env
        .vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_unsupported_operations_skip_backend() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let connects = env.backend.connect_count();

    for file_type in [FileType::Directory, FileType::Symlink, FileType::Fifo] {
        let err = env
            .vfs
            .create(ALICE, root, "x", file_type, 0o644)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::Unsupported(_)));
        assert_eq!(err.errno(), libc::ENOTSUP);
    }
    assert!(matches!(
        env.vfs.link(ALICE, root, root, "l").await,
        Err(VfsError::Unsupported(_))
    ));
    assert!(matches!(
        env.vfs.symlink(ALICE, root, "s", "/etc/passwd").await,
        Err(VfsError::Unsupported(_))
    ));
    assert!(matches!(
        env.vfs.readlink(ALICE, root).await,
        Err(VfsError::Unsupported(_))
    ));

    assert_eq!(env.backend.connect_count(), connects);
}

#[tokio::test]
async fn test_setattr_returns_current_attributes() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let file = env
        .vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap();
    let before = env.vfs.getattr(ALICE, file).await.unwrap();

    let changes = SetAttributes {
        mode: Some(0o777),
        size: Some(42),
        ..SetAttributes::default()
    };
    let after = env.vfs.setattr(ALICE, file, changes).await.unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_commit_fs_stat_and_parent() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let dir = env.vfs.mkdir(ALICE, root, "d", 0o755).await.unwrap();

    env.vfs.commit(ALICE, dir, 0, 0).await.unwrap();
    assert!(matches!(
        env.vfs.commit(ALICE, 9_999, 0, 0).await,
        Err(VfsError::NotFound(_))
    ));

    let stat = env.vfs.fs_stat(ALICE, root).await.unwrap();
    assert!(stat.total_bytes > 0);
    assert_eq!(stat.free_files, stat.total_files);

    assert_eq!(env.vfs.parent_of(root).unwrap(), root);
    assert_eq!(env.vfs.parent_of(dir).unwrap(), root);
    assert_eq!(env.vfs.lookup(ALICE, dir, "..").await.unwrap(), root);
    assert_eq!(env.vfs.lookup(ALICE, dir, ".").await.unwrap(), dir);
}

#[tokio::test]
async fn test_remove_unmaps_handle() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let dir = env.vfs.mkdir(ALICE, root, "d", 0o755).await.unwrap();
    let file = env
        .vfs
        .create(ALICE, dir, "f", FileType::Regular, 0o644)
        .await
        .unwrap();

    let err = env.vfs.remove(ALICE, root, "d").await.unwrap_err();
    assert!(matches!(err, VfsError::NotEmpty(_)));
    assert_eq!(env.vfs.inodes().path_of(dir), Some(common::path("d")));

    env.vfs.remove(ALICE, dir, "f").await.unwrap();
    assert!(env.vfs.inodes().path_of(file).is_none());
    assert!(matches!(
        env.vfs.getattr(ALICE, file).await,
        Err(VfsError::NotFound(_))
    ));

    env.vfs.remove(ALICE, root, "d").await.unwrap();
    assert!(env.vfs.inodes().handle_of(&common::path("d")).is_none());
}

#[tokio::test]
async fn test_write_without_permission_denied() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let file = env
        .vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap();

    let err = env
        .vfs
        .write(BOB, file, 0, b"nope", Stability::FileSync)
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::PermissionDenied(_)));
    assert_eq!(err.errno(), libc::EACCES);
}

#[tokio::test]
async fn test_write_beyond_size_limit_rejected() {
    let env = setup_test_env().await;
    let root = env.vfs.root_handle();
    let file = env
        .vfs
        .create(ALICE, root, "f", FileType::Regular, 0o644)
        .await
        .unwrap();
    env.vfs
        .write(ALICE, file, 0, b"keep", Stability::FileSync)
        .await
        .unwrap();

    let err = env
        .vfs
        .write(ALICE, file, u64::MAX - 1, b"xyz", Stability::Unstable)
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::FileTooLarge(_)));
    assert_eq!(err.errno(), libc::EFBIG);

    assert_eq!(env.vfs.read(ALICE, file, 0, 16).await.unwrap(), b"keep");
    assert_eq!(env.backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_root_carries_store_identifier() {
    let env = setup_test_env().await;

    let session = SessionGuard::open(&env.backend, &admin_account())
        .await
        .unwrap();
    let stat = session.stat(Path::new(MOUNT_POINT)).await.unwrap();
    drop(session);

    assert!(stat.object_id.is_some());
    assert_eq!(env.vfs.root_object_id(), stat.object_id);
    assert_eq!(
        env.vfs.inodes().path_of(env.vfs.root_handle()).as_deref(),
        Some(Path::new(MOUNT_POINT))
    );
}
