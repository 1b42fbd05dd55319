//! Filesystem operations for the protocol engine
//!
//! Every operation takes the caller's uid, resolves handles through the
//! [`InodeMap`], answers from [`VfsCache`] where it can and otherwise opens
//! a backend session that is closed before the operation returns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use common::prelude::{
    Backend, ObjStat, ObjectKind, PermissionEntry, PermissionLevel, SessionGuard,
    UserType,
};

use super::acl::{self, AccessDecision, Ace, AceMask};
use super::allowlist::AclAllowlist;
use super::cache::{CacheTtls, CachedListing, UserProfile, VfsCache};
use super::error::{BackendContext, VfsError};
use super::id_mapper::{IdMapper, ResolvedUser};
use super::inode_map::{Handle, InodeMap, ROOT_HANDLE};

/// Cookies 0, 1 and 2 belong to the protocol; entry `i` gets `i + 3`
pub const FIRST_ENTRY_COOKIE: u64 = 3;

/// Capacity reported by `fs_stat`; the backend exposes no quota
const REPORTED_CAPACITY_BYTES: u64 = 1 << 50;
const REPORTED_CAPACITY_FILES: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Socket,
    Fifo,
}

/// Durability of a completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stability {
    Unstable,
    DataSync,
    FileSync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub handle: Handle,
    pub kind: ObjectKind,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
}

/// Attribute changes requested by the client. None of them reach the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub handle: Handle,
    pub cookie: u64,
    pub attributes: FileAttributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
}

#[derive(Debug, Clone)]
pub struct VfsOptions {
    /// Backend collection exposed as the root handle
    pub mount_point: PathBuf,
    pub zone: String,
    /// Whether `create` replaces an existing data object
    pub allow_overwrite: bool,
    pub ttls: CacheTtls,
}

pub struct NfsVfs {
    backend: Arc<dyn Backend>,
    inodes: InodeMap,
    ids: Arc<IdMapper>,
    cache: VfsCache,
    allowlist: Arc<AclAllowlist>,
    options: VfsOptions,
    /// Store identifier of the mount point, paired with the root handle
    root_object_id: Option<u64>,
}

impl NfsVfs {
    /// Build the adapter, mapping the root handle onto the mount point once
    ///  the backend confirms it exists.
    pub async fn new(
        backend: Arc<dyn Backend>,
        ids: Arc<IdMapper>,
        allowlist: Arc<AclAllowlist>,
        options: VfsOptions,
    ) -> Result<Self, VfsError> {
        let root_object_id = {
            let session = SessionGuard::open(backend.as_ref(), ids.admin_account())
                .await
                .context("mount", &options.mount_point)?;
            let stat = session
                .stat(&options.mount_point)
                .await
                .context("mount", &options.mount_point)?;
            if !stat.kind.is_collection() {
                return Err(VfsError::NotADirectory(
                    options.mount_point.display().to_string(),
                ));
            }
            stat.object_id
        };

        let inodes = InodeMap::new();
        inodes.establish_root(&options.mount_point)?;
        tracing::info!(
            mount_point = %options.mount_point.display(),
            handle = ROOT_HANDLE,
            object_id = ?root_object_id,
            "root handle established"
        );

        Ok(Self {
            backend,
            inodes,
            cache: VfsCache::new(&options.ttls),
            ids,
            allowlist,
            options,
            root_object_id,
        })
    }

    pub fn root_object_id(&self) -> Option<u64> {
        self.root_object_id
    }

    pub fn inodes(&self) -> &InodeMap {
        &self.inodes
    }

    pub fn root_handle(&self) -> Handle {
        ROOT_HANDLE
    }

    pub async fn lookup(&self, uid: u32, parent: Handle, name: &str) -> Result<Handle, VfsError> {
        tracing::debug!(uid, parent, name, "vfs::lookup");
        match name {
            "." => return self.path_of(parent).map(|_| parent),
            ".." => return self.parent_of(parent),
            _ => {}
        }

        let user = self.ids.resolve(uid).await?;
        let path = self.child_path(parent, name)?;
        let session = self.session(&user).await?;
        let stat = session.stat(&path).await.context("lookup", &path)?;
        self.cache.put_object_type(&path, stat.kind);
        Ok(self.inodes.handle_for(&path))
    }

    pub async fn getattr(&self, uid: u32, handle: Handle) -> Result<FileAttributes, VfsError> {
        tracing::debug!(uid, handle, "vfs::getattr");
        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(handle)?;
        if let Some(attributes) = self.cache.attributes(&user.name, &path) {
            return Ok(attributes);
        }

        let session = self.session(&user).await?;
        self.fetch_attributes(&session, &user, handle, &path).await
    }

    /// Attribute changes are not forwarded to the backend; the current
    ///  attributes are returned unchanged.
    pub async fn setattr(
        &self,
        uid: u32,
        handle: Handle,
        changes: SetAttributes,
    ) -> Result<FileAttributes, VfsError> {
        let path = self.path_of(handle)?;
        if let Some(mode) = changes.mode {
            tracing::warn!(uid, path = %path.display(), mode = %format!("{:o}", mode), "ignoring mode change");
        }
        if let Some(size) = changes.size {
            tracing::warn!(uid, path = %path.display(), size, "ignoring size change");
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            tracing::debug!(uid, path = %path.display(), "ignoring ownership change");
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            tracing::debug!(uid, path = %path.display(), "ignoring timestamp change");
        }
        self.getattr(uid, handle).await
    }

    /// Entries of a collection whose cookie is greater than `cookie`
    pub async fn list(
        &self,
        uid: u32,
        directory: Handle,
        cookie: u64,
    ) -> Result<Vec<DirEntry>, VfsError> {
        tracing::debug!(uid, directory, cookie, "vfs::list");
        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(directory)?;
        let session = self.session(&user).await?;

        let stat = session.stat(&path).await.context("list", &path)?;
        if !stat.kind.is_collection() {
            return Err(VfsError::NotADirectory(path.display().to_string()));
        }

        let listing = match self.cache.listing(&user.name, &path) {
            Some(cached) if cached.modified_marker == stat.modified_at => cached,
            _ => {
                let entries = session.list(&path).await.context("list", &path)?;
                let fresh = CachedListing {
                    entries: Arc::new(entries),
                    modified_marker: stat.modified_at,
                };
                self.cache.put_listing(&user.name, &path, fresh.clone());
                fresh
            }
        };

        let mut entries = Vec::new();
        for (index, entry) in listing.entries.iter().enumerate() {
            let entry_cookie = index as u64 + FIRST_ENTRY_COOKIE;
            if entry_cookie <= cookie {
                continue;
            }

            let child = path.join(&entry.name);
            let handle = self.inodes.handle_for(&child);
            self.cache.put_object_type(&child, entry.kind);
            let attributes = match self.cache.attributes(&user.name, &child) {
                Some(attributes) => attributes,
                None => match self.fetch_attributes(&session, &user, handle, &child).await {
                    Ok(attributes) => attributes,
                    Err(VfsError::NotFound(_)) => {
                        tracing::debug!(path = %child.display(), "entry vanished while listing");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            entries.push(DirEntry {
                name: entry.name.clone(),
                handle,
                cookie: entry_cookie,
                attributes,
            });
        }
        Ok(entries)
    }

    /// Changes whenever the collection's contents change
    pub async fn directory_verifier(&self, uid: u32, directory: Handle) -> Result<u64, VfsError> {
        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(directory)?;
        let session = self.session(&user).await?;
        let stat = session.stat(&path).await.context("directory_verifier", &path)?;
        Ok(stat.modified_at.timestamp_micros() as u64)
    }

    pub async fn create(
        &self,
        uid: u32,
        parent: Handle,
        name: &str,
        file_type: FileType,
        mode: u32,
    ) -> Result<Handle, VfsError> {
        tracing::debug!(uid, parent, name, ?file_type, mode = %format!("{:o}", mode), "vfs::create");
        if file_type != FileType::Regular {
            return Err(VfsError::Unsupported("only regular files can be created"));
        }

        let user = self.ids.resolve(uid).await?;
        let path = self.child_path(parent, name)?;
        {
            let session = self.session(&user).await?;
            session
                .create_data_object(&path, self.options.allow_overwrite)
                .await
                .context("create", &path)?;
        }

        self.cache.put_object_type(&path, ObjectKind::DataObject);
        self.cache.invalidate_attributes(&path);
        Ok(self.inodes.handle_for(&path))
    }

    pub async fn mkdir(
        &self,
        uid: u32,
        parent: Handle,
        name: &str,
        mode: u32,
    ) -> Result<Handle, VfsError> {
        tracing::debug!(uid, parent, name, mode = %format!("{:o}", mode), "vfs::mkdir");
        let user = self.ids.resolve(uid).await?;
        let path = self.child_path(parent, name)?;
        {
            let session = self.session(&user).await?;
            session
                .create_collection(&path)
                .await
                .context("mkdir", &path)?;
        }

        self.cache.put_object_type(&path, ObjectKind::Collection);
        self.cache.invalidate_attributes(&path);
        Ok(self.inodes.handle_for(&path))
    }

    pub async fn remove(&self, uid: u32, parent: Handle, name: &str) -> Result<(), VfsError> {
        tracing::debug!(uid, parent, name, "vfs::remove");
        let user = self.ids.resolve(uid).await?;
        let path = self.child_path(parent, name)?;
        {
            let session = self.session(&user).await?;
            session.remove(&path).await.context("remove", &path)?;
        }

        self.cache.invalidate_tree(&path);
        if let Some(handle) = self.inodes.handle_of(&path) {
            self.inodes
                .unmap(handle, &path)
                .map_err(|e| invariant("remove", e))?;
        }
        Ok(())
    }

    /// Move `from_name` in `from_parent` to `to_name` in `to_parent`. The
    ///  moved handle, and any mapped descendants, keep their handles.
    pub async fn rename(
        &self,
        uid: u32,
        from_parent: Handle,
        from_name: &str,
        to_parent: Handle,
        to_name: &str,
    ) -> Result<(), VfsError> {
        tracing::debug!(uid, from_parent, from_name, to_parent, to_name, "vfs::rename");
        let user = self.ids.resolve(uid).await?;
        let from = self.child_path(from_parent, from_name)?;
        let to = self.child_path(to_parent, to_name)?;
        if from == to {
            return Ok(());
        }

        self.inodes.check_move(&from, &to)?;
        {
            let session = self.session(&user).await?;
            session.rename(&from, &to).await.context("rename", &from)?;
        }

        self.cache.invalidate_tree(&from);
        self.cache.invalidate_tree(&to);
        // registry was checked before the backend call; a failure here means
        // a concurrent mutation raced us and the move is not reflected
        self.inodes
            .move_tree(&from, &to)
            .map_err(|e| invariant("rename", e))?;
        Ok(())
    }

    pub async fn read(
        &self,
        uid: u32,
        handle: Handle,
        offset: u64,
        count: usize,
    ) -> Result<Vec<u8>, VfsError> {
        tracing::debug!(uid, handle, offset, count, "vfs::read");
        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(handle)?;
        let session = self.session(&user).await?;
        session.read(&path, offset, count).await.context("read", &path)
    }

    /// Writes go straight to the backend, so every write is file-synced
    ///  whatever the client asked for.
    pub async fn write(
        &self,
        uid: u32,
        handle: Handle,
        offset: u64,
        data: &[u8],
        requested: Stability,
    ) -> Result<(usize, Stability), VfsError> {
        tracing::debug!(uid, handle, offset, len = data.len(), ?requested, "vfs::write");
        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(handle)?;
        let written = {
            let session = self.session(&user).await?;
            session.write(&path, offset, data).await.context("write", &path)?
        };

        self.cache.invalidate_attributes(&path);
        Ok((written, Stability::FileSync))
    }

    /// Nothing is buffered, so there is nothing to flush
    pub async fn commit(&self, uid: u32, handle: Handle, offset: u64, count: u64) -> Result<(), VfsError> {
        tracing::debug!(uid, handle, offset, count, "vfs::commit");
        self.path_of(handle).map(|_| ())
    }

    pub async fn get_acl(&self, uid: u32, handle: Handle) -> Result<Vec<Ace>, VfsError> {
        tracing::debug!(uid, handle, "vfs::get_acl");
        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(handle)?;
        let session = self.session(&user).await?;
        let entries = self.permissions(&session, &path).await?;
        Ok(acl::to_protocol_acl(&entries, &self.ids))
    }

    /// Replace the ACL of `handle` with `aces`. Entries that cannot be
    ///  represented are dropped; an empty list changes nothing.
    pub async fn set_acl(&self, uid: u32, handle: Handle, aces: &[Ace]) -> Result<(), VfsError> {
        tracing::debug!(uid, handle, count = aces.len(), "vfs::set_acl");
        if aces.is_empty() {
            return Ok(());
        }

        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(handle)?;
        let session = self.session(&user).await?;

        // admins and allow-listed accounts edit ACLs through the proxy account
        let profile = self.user_profile(&session, &user.name).await?;
        let privileged = profile.user_type == UserType::Admin
            || self.allowlist.is_allowed(&user.name, &profile.groups, &path);
        let admin_session;
        let session = if privileged && user.account.client_user != self.ids.admin_account().client_user {
            admin_session = SessionGuard::open(self.backend.as_ref(), self.ids.admin_account())
                .await
                .context("set_acl", &path)?;
            &admin_session
        } else {
            &session
        };

        let stat = session.stat(&path).await.context("set_acl", &path)?;
        let current = session.permissions(&path).await.context("set_acl", &path)?;
        let mut incoming = Vec::new();
        for ace in aces {
            if let Some(entry) = acl::to_permission_entry(ace, &self.ids, &**session)
                .await
                .context("set_acl", &path)?
            {
                incoming.push(entry);
            }
        }

        let diff = acl::diff_acl(&current, &incoming, &stat.owner_name);
        for entry in &diff.removed {
            session.revoke(&path, entry).await.context("set_acl", &path)?;
        }
        for entry in &diff.added {
            session.grant(&path, entry).await.context("set_acl", &path)?;
        }
        tracing::debug!(
            path = %path.display(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "applied ACL"
        );

        self.cache.invalidate_permissions(&path);
        self.cache.invalidate_attributes(&path);
        Ok(())
    }

    pub async fn check_access(
        &self,
        uid: u32,
        handle: Handle,
        mask: AceMask,
    ) -> Result<AccessDecision, VfsError> {
        tracing::debug!(uid, handle, ?mask, "vfs::check_access");
        let user = self.ids.resolve(uid).await?;
        let path = self.path_of(handle)?;

        if let Some(decision) = self.cache.access(user.uid, mask.bits(), &path) {
            return Ok(decision);
        }
        let decision = self.decide_access(&user, &path, mask).await?;
        self.cache.put_access(user.uid, mask.bits(), &path, decision);
        Ok(decision)
    }

    async fn decide_access(
        &self,
        user: &ResolvedUser,
        path: &Path,
        mask: AceMask,
    ) -> Result<AccessDecision, VfsError> {
        if acl::is_structural_path(path, &self.options.zone) {
            return Ok(AccessDecision::Allow);
        }

        let session = self.session(user).await?;
        let kind = self.object_kind(&session, path).await?;
        if kind.is_collection() && acl::is_traversal_only(mask) {
            return Ok(AccessDecision::Allow);
        }

        if acl::is_attribute_only(mask) {
            let profile = self.user_profile(&session, &user.name).await?;
            if profile.user_type == UserType::Admin {
                return Ok(AccessDecision::Allow);
            }
            if self.allowlist.is_allowed(&user.name, &profile.groups, path) {
                return Ok(AccessDecision::Allow);
            }
        }

        let level = self.user_level(&session, user, path).await?;
        Ok(acl::level_decision(level, mask))
    }

    /// The root is its own parent
    pub fn parent_of(&self, handle: Handle) -> Result<Handle, VfsError> {
        let path = self.path_of(handle)?;
        if handle == ROOT_HANDLE || path == self.options.mount_point {
            return Ok(ROOT_HANDLE);
        }
        match path.parent() {
            Some(parent) => Ok(self.inodes.handle_for(parent)),
            None => Ok(ROOT_HANDLE),
        }
    }

    pub async fn link(&self, uid: u32, _handle: Handle, _parent: Handle, name: &str) -> Result<Handle, VfsError> {
        tracing::debug!(uid, name, "vfs::link");
        Err(VfsError::Unsupported("hard links"))
    }

    pub async fn symlink(
        &self,
        uid: u32,
        _parent: Handle,
        name: &str,
        _target: &str,
    ) -> Result<Handle, VfsError> {
        tracing::debug!(uid, name, "vfs::symlink");
        Err(VfsError::Unsupported("symbolic links"))
    }

    pub async fn readlink(&self, uid: u32, handle: Handle) -> Result<String, VfsError> {
        tracing::debug!(uid, handle, "vfs::readlink");
        Err(VfsError::Unsupported("symbolic links"))
    }

    pub async fn fs_stat(&self, uid: u32, handle: Handle) -> Result<FsStat, VfsError> {
        tracing::debug!(uid, handle, "vfs::fs_stat");
        self.path_of(handle)?;
        Ok(FsStat {
            total_bytes: REPORTED_CAPACITY_BYTES,
            free_bytes: REPORTED_CAPACITY_BYTES,
            avail_bytes: REPORTED_CAPACITY_BYTES,
            total_files: REPORTED_CAPACITY_FILES,
            free_files: REPORTED_CAPACITY_FILES,
            avail_files: REPORTED_CAPACITY_FILES,
        })
    }

    fn path_of(&self, handle: Handle) -> Result<PathBuf, VfsError> {
        self.inodes
            .path_of(handle)
            .ok_or_else(|| VfsError::handle_not_found(handle))
    }

    fn child_path(&self, parent: Handle, name: &str) -> Result<PathBuf, VfsError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(VfsError::NotFound(name.to_string()));
        }
        Ok(self.path_of(parent)?.join(name))
    }

    async fn session(&self, user: &ResolvedUser) -> Result<SessionGuard, VfsError> {
        SessionGuard::open(self.backend.as_ref(), &user.account)
            .await
            .context("connect", &user.account.home)
    }

    async fn fetch_attributes(
        &self,
        session: &SessionGuard,
        user: &ResolvedUser,
        handle: Handle,
        path: &Path,
    ) -> Result<FileAttributes, VfsError> {
        let stat = session.stat(path).await.context("getattr", path)?;
        self.cache.put_object_type(path, stat.kind);

        let structural = acl::is_structural_path(path, &self.options.zone);
        let level = if structural {
            None
        } else {
            self.user_level(session, user, path).await?
        };
        let attributes = self.attributes_from_stat(handle, &stat, structural, level);
        self.cache.put_attributes(&user.name, path, attributes.clone());
        Ok(attributes)
    }

    fn attributes_from_stat(
        &self,
        handle: Handle,
        stat: &ObjStat,
        structural: bool,
        level: Option<PermissionLevel>,
    ) -> FileAttributes {
        let (uid, gid) = self.ids.ids_for_name(&stat.owner_name);
        FileAttributes {
            handle,
            kind: stat.kind,
            mode: acl::compute_mode(stat.kind, structural, level),
            nlink: if stat.kind.is_collection() { 2 } else { 1 },
            uid,
            gid,
            size: stat.size,
            atime: stat.modified_at,
            mtime: stat.modified_at,
            ctime: stat.created_at,
        }
    }

    async fn object_kind(&self, session: &SessionGuard, path: &Path) -> Result<ObjectKind, VfsError> {
        if let Some(kind) = self.cache.object_type(path) {
            return Ok(kind);
        }
        let stat = session.stat(path).await.context("stat", path)?;
        self.cache.put_object_type(path, stat.kind);
        Ok(stat.kind)
    }

    async fn permissions(
        &self,
        session: &SessionGuard,
        path: &Path,
    ) -> Result<Arc<Vec<PermissionEntry>>, VfsError> {
        if let Some(entries) = self.cache.permissions(path) {
            return Ok(entries);
        }
        let entries = Arc::new(session.permissions(path).await.context("permissions", path)?);
        self.cache.put_permissions(path, entries.clone());
        Ok(entries)
    }

    async fn user_profile(&self, session: &SessionGuard, name: &str) -> Result<UserProfile, VfsError> {
        if let Some(profile) = self.cache.user_profile(name) {
            return Ok(profile);
        }

        let path = Path::new(name);
        let profile = match session.find_user(name).await.context("user_type", path)? {
            Some(found) => UserProfile {
                user_type: found.user_type,
                groups: session.user_groups(name).await.context("user_groups", path)?,
            },
            None => {
                tracing::warn!(name, "account missing from backend, treating as regular");
                UserProfile {
                    user_type: UserType::Regular,
                    groups: Vec::new(),
                }
            }
        };
        self.cache.put_user_profile(name, profile.clone());
        Ok(profile)
    }

    async fn user_level(
        &self,
        session: &SessionGuard,
        user: &ResolvedUser,
        path: &Path,
    ) -> Result<Option<PermissionLevel>, VfsError> {
        let profile = self.user_profile(session, &user.name).await?;
        let entries = self.permissions(session, path).await?;
        Ok(acl::effective_level(&entries, &user.name, &profile.groups))
    }
}

fn invariant(op: &'static str, err: super::inode_map::InodeMapError) -> VfsError {
    tracing::error!(op, error = %err, "handle registry out of sync with backend");
    VfsError::Invariant(err)
}
