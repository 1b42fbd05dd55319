//! TTL caches in front of the backend
//!
//! Uses moka for concurrent caching with per-axis time-to-live. Entries whose
//! value depends on who is asking are keyed by the requesting user as well.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;

use common::prelude::{ListingEntry, ObjectKind, PermissionEntry, UserType};

use super::acl::AccessDecision;
use super::nfs_vfs::FileAttributes;

/// Time-to-live for each cache
#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub attributes: Duration,
    pub access: Duration,
    pub object_type: Duration,
    pub permissions: Duration,
    pub listing: Duration,
    pub user_type: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            attributes: Duration::from_millis(1_000),
            access: Duration::from_millis(1_000),
            object_type: Duration::from_millis(300_000),
            permissions: Duration::from_millis(300_000),
            listing: Duration::from_millis(30_000),
            user_type: Duration::from_millis(300_000),
        }
    }
}

/// A collection's children as fetched, with the collection's modification
///  time at fetch time.
#[derive(Debug, Clone)]
pub struct CachedListing {
    pub entries: Arc<Vec<ListingEntry>>,
    pub modified_marker: DateTime<Utc>,
}

/// What the backend says about an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_type: UserType,
    pub groups: Vec<String>,
}

type UserPath = (String, PathBuf);
type AccessKey = (u32, u32, PathBuf);

pub struct VfsCache {
    attributes: Cache<UserPath, FileAttributes>,
    access: Cache<AccessKey, AccessDecision>,
    object_types: Cache<PathBuf, ObjectKind>,
    permissions: Cache<PathBuf, Arc<Vec<PermissionEntry>>>,
    listings: Cache<UserPath, CachedListing>,
    user_profiles: Cache<String, UserProfile>,
}

impl VfsCache {
    pub fn new(ttls: &CacheTtls) -> Self {
        Self {
            attributes: Cache::builder()
                .time_to_live(ttls.attributes)
                .support_invalidation_closures()
                .build(),
            access: Cache::builder().time_to_live(ttls.access).build(),
            object_types: Cache::builder()
                .time_to_live(ttls.object_type)
                .support_invalidation_closures()
                .build(),
            permissions: Cache::builder()
                .time_to_live(ttls.permissions)
                .support_invalidation_closures()
                .build(),
            listings: Cache::builder().time_to_live(ttls.listing).build(),
            user_profiles: Cache::builder().time_to_live(ttls.user_type).build(),
        }
    }

    pub fn attributes(&self, user: &str, path: &Path) -> Option<FileAttributes> {
        self.attributes.get(&(user.to_string(), path.to_path_buf()))
    }

    pub fn put_attributes(&self, user: &str, path: &Path, attributes: FileAttributes) {
        self.attributes
            .insert((user.to_string(), path.to_path_buf()), attributes);
    }

    /// Drop every user's attributes for `path`
    pub fn invalidate_attributes(&self, path: &Path) {
        let path = path.to_path_buf();
        if let Err(e) = self
            .attributes
            .invalidate_entries_if(move |(_, p), _| *p == path)
        {
            tracing::warn!(error = %e, "attribute invalidation failed, clearing all");
            self.attributes.invalidate_all();
        }
    }

    /// Drop attributes, object types and permission lists for `root` and
    ///  everything below it
    pub fn invalidate_tree(&self, root: &Path) {
        let attr_root = root.to_path_buf();
        let type_root = root.to_path_buf();
        let perm_root = root.to_path_buf();

        let results = [
            self.attributes
                .invalidate_entries_if(move |(_, p), _| p.starts_with(&attr_root))
                .map(|_| ()),
            self.object_types
                .invalidate_entries_if(move |p, _| p.starts_with(&type_root))
                .map(|_| ()),
            self.permissions
                .invalidate_entries_if(move |p, _| p.starts_with(&perm_root))
                .map(|_| ()),
        ];
        if results.iter().any(|r| r.is_err()) {
            tracing::warn!(path = %root.display(), "tree invalidation failed, clearing all");
            self.attributes.invalidate_all();
            self.object_types.invalidate_all();
            self.permissions.invalidate_all();
        }
    }

    pub fn access(&self, uid: u32, mask: u32, path: &Path) -> Option<AccessDecision> {
        self.access.get(&(uid, mask, path.to_path_buf()))
    }

    pub fn put_access(&self, uid: u32, mask: u32, path: &Path, decision: AccessDecision) {
        self.access.insert((uid, mask, path.to_path_buf()), decision);
    }

    pub fn object_type(&self, path: &Path) -> Option<ObjectKind> {
        self.object_types.get(&path.to_path_buf())
    }

    pub fn put_object_type(&self, path: &Path, kind: ObjectKind) {
        self.object_types.insert(path.to_path_buf(), kind);
    }

    pub fn permissions(&self, path: &Path) -> Option<Arc<Vec<PermissionEntry>>> {
        self.permissions.get(&path.to_path_buf())
    }

    pub fn put_permissions(&self, path: &Path, entries: Arc<Vec<PermissionEntry>>) {
        self.permissions.insert(path.to_path_buf(), entries);
    }

    pub fn invalidate_permissions(&self, path: &Path) {
        self.permissions.invalidate(&path.to_path_buf());
    }

    pub fn listing(&self, user: &str, collection: &Path) -> Option<CachedListing> {
        self.listings
            .get(&(user.to_string(), collection.to_path_buf()))
    }

    pub fn put_listing(&self, user: &str, collection: &Path, listing: CachedListing) {
        self.listings
            .insert((user.to_string(), collection.to_path_buf()), listing);
    }

    pub fn user_profile(&self, name: &str) -> Option<UserProfile> {
        self.user_profiles.get(name)
    }

    pub fn put_user_profile(&self, name: &str, profile: UserProfile) {
        self.user_profiles.insert(name.to_string(), profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(mode: u32) -> FileAttributes {
        let now = Utc::now();
        FileAttributes {
            handle: 7,
            kind: ObjectKind::DataObject,
            mode,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    #[test]
    fn test_attributes_are_user_scoped() {
        let cache = VfsCache::new(&CacheTtls::default());
        let path = Path::new("/z/home/alice/f");
        cache.put_attributes("alice", path, attrs(0o100_600));
        cache.put_attributes("bob", path, attrs(0o100_400));

        assert_eq!(cache.attributes("alice", path).unwrap().mode, 0o100_600);
        assert_eq!(cache.attributes("bob", path).unwrap().mode, 0o100_400);
        assert!(cache.attributes("carol", path).is_none());
    }

    #[test]
    fn test_invalidate_attributes_for_every_user() {
        let cache = VfsCache::new(&CacheTtls::default());
        let path = Path::new("/z/home/alice/f");
        let other = Path::new("/z/home/alice/g");
        cache.put_attributes("alice", path, attrs(0o100_600));
        cache.put_attributes("bob", path, attrs(0o100_400));
        cache.put_attributes("alice", other, attrs(0o100_600));

        cache.invalidate_attributes(path);
        assert!(cache.attributes("alice", path).is_none());
        assert!(cache.attributes("bob", path).is_none());
        assert!(cache.attributes("alice", other).is_some());
    }

    #[test]
    fn test_invalidate_tree() {
        let cache = VfsCache::new(&CacheTtls::default());
        cache.put_object_type(Path::new("/z/a"), ObjectKind::Collection);
        cache.put_object_type(Path::new("/z/a/f"), ObjectKind::DataObject);
        cache.put_object_type(Path::new("/z/ab"), ObjectKind::DataObject);

        cache.invalidate_tree(Path::new("/z/a"));
        assert!(cache.object_type(Path::new("/z/a")).is_none());
        assert!(cache.object_type(Path::new("/z/a/f")).is_none());
        assert_eq!(
            cache.object_type(Path::new("/z/ab")),
            Some(ObjectKind::DataObject)
        );
    }

    #[test]
    fn test_entries_expire() {
        let ttls = CacheTtls {
            access: Duration::from_millis(20),
            ..CacheTtls::default()
        };
        let cache = VfsCache::new(&ttls);
        let path = Path::new("/z/f");
        cache.put_access(1000, 0x1, path, AccessDecision::Deny);
        assert_eq!(cache.access(1000, 0x1, path), Some(AccessDecision::Deny));
        assert!(cache.access(1001, 0x1, path).is_none());

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.access(1000, 0x1, path).is_none());
    }
}
