use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use super::types::{
    Account, BackendUser, ListingEntry, ObjStat, ObjectKind, PermissionEntry, PermissionLevel,
    SubjectKind, UserType,
};
use super::{Backend, BackendError, Session};

/// Largest data object the store will hold
pub const MAX_OBJECT_SIZE: u64 = 1 << 32;

#[derive(Debug, Clone)]
struct MemoryObject {
    id: u64,
    kind: ObjectKind,
    data: Vec<u8>,
    owner: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    acl: Vec<PermissionEntry>,
}

#[derive(Debug, Clone)]
struct MemoryUser {
    user_type: UserType,
    groups: BTreeSet<String>,
    metadata: Vec<(String, String)>,
}

#[derive(Debug)]
struct MemoryStore {
    zone: String,
    objects: BTreeMap<PathBuf, MemoryObject>,
    users: HashMap<String, MemoryUser>,
    /// Last timestamp handed out; modification times are strictly increasing
    last_tick: DateTime<Utc>,
    next_id: u64,
}

/// In-memory object store with a single zone.
///
/// Enforces the same permission model as the real store: reads need `read`,
/// mutations need `write`, ACL changes need `own`, admins bypass all checks.
/// Collections get a fresh modification time whenever a child is created,
/// removed or renamed, so listings can be revalidated against it.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<MemoryStore>>,
    open_sessions: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Create a store for `zone` with the standard `home`, `public` and
    ///  `trash` collections, all owned by the admin account `admin`.
    pub fn new(zone: &str, admin: &str) -> Self {
        let mut store = MemoryStore {
            zone: zone.to_string(),
            objects: BTreeMap::new(),
            users: HashMap::new(),
            last_tick: Utc::now(),
            next_id: 10_000,
        };
        store.users.insert(
            admin.to_string(),
            MemoryUser {
                user_type: UserType::Admin,
                groups: BTreeSet::new(),
                metadata: Vec::new(),
            },
        );

        let zone_root = PathBuf::from("/").join(zone);
        for path in [
            PathBuf::from("/"),
            zone_root.clone(),
            zone_root.join("home"),
            zone_root.join("public"),
            zone_root.join("trash"),
        ] {
            store.insert_object(path, ObjectKind::Collection, admin, Vec::new());
        }

        Self {
            inner: Arc::new(RwLock::new(store)),
            open_sessions: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn zone(&self) -> String {
        self.inner.read().zone.clone()
    }

    /// Register an account. Regular and admin accounts get a home
    ///  collection they own.
    pub fn add_user(&self, name: &str, user_type: UserType) {
        let mut store = self.inner.write();
        store.users.insert(
            name.to_string(),
            MemoryUser {
                user_type,
                groups: BTreeSet::new(),
                metadata: Vec::new(),
            },
        );
        if user_type != UserType::Group {
            let home = PathBuf::from("/").join(&store.zone).join("home").join(name);
            if !store.objects.contains_key(&home) {
                store.insert_object(home, ObjectKind::Collection, name, Vec::new());
            }
        }
    }

    /// Register a group with the given members
    pub fn add_group(&self, name: &str, members: &[&str]) {
        let mut store = self.inner.write();
        store.users.insert(
            name.to_string(),
            MemoryUser {
                user_type: UserType::Group,
                groups: BTreeSet::new(),
                metadata: Vec::new(),
            },
        );
        for member in members {
            if let Some(user) = store.users.get_mut(*member) {
                user.groups.insert(name.to_string());
            }
        }
    }

    pub fn add_collection(&self, path: &Path, owner: &str) -> Result<(), BackendError> {
        let mut store = self.inner.write();
        store.check_new_child(path)?;
        store.insert_object(path.to_path_buf(), ObjectKind::Collection, owner, Vec::new());
        Ok(())
    }

    pub fn add_data_object(&self, path: &Path, owner: &str, data: &[u8]) -> Result<(), BackendError> {
        let mut store = self.inner.write();
        store.check_new_child(path)?;
        store.insert_object(path.to_path_buf(), ObjectKind::DataObject, owner, data.to_vec());
        Ok(())
    }

    /// Grant a permission without going through a session
    pub fn grant_permission(&self, path: &Path, entry: PermissionEntry) -> Result<(), BackendError> {
        let mut store = self.inner.write();
        let object = store
            .objects
            .get_mut(path)
            .ok_or_else(|| BackendError::NotFound(path.to_path_buf()))?;
        object.acl.retain(|e| !(e.name == entry.name && e.zone == entry.zone));
        object.acl.push(entry);
        Ok(())
    }

    /// Attach a metadata attribute to an account or group
    pub fn set_user_metadata(&self, name: &str, attribute: &str, value: &str) {
        let mut store = self.inner.write();
        if let Some(user) = store.users.get_mut(name) {
            user.metadata.push((attribute.to_string(), value.to_string()));
        }
    }

    /// Drop every metadata value of `attribute` from an account or group
    pub fn remove_user_metadata(&self, name: &str, attribute: &str) {
        let mut store = self.inner.write();
        if let Some(user) = store.users.get_mut(name) {
            user.metadata.retain(|(a, _)| a != attribute);
        }
    }

    /// Number of sessions currently open
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Number of sessions ever opened
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl MemoryStore {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = if now > self.last_tick {
            now
        } else {
            self.last_tick + Duration::microseconds(1)
        };
        self.last_tick = next;
        next
    }

    fn touch_parent(&mut self, path: &Path) {
        let now = self.tick();
        if let Some(parent) = path.parent() {
            if let Some(object) = self.objects.get_mut(parent) {
                object.modified_at = now;
            }
        }
    }

    fn insert_object(&mut self, path: PathBuf, kind: ObjectKind, owner: &str, data: Vec<u8>) {
        let now = self.tick();
        let id = self.next_id;
        self.next_id += 1;
        let acl = vec![PermissionEntry::new(
            owner,
            SubjectKind::Individual,
            self.zone.clone(),
            PermissionLevel::Own,
        )];
        self.objects.insert(
            path.clone(),
            MemoryObject {
                id,
                kind,
                data,
                owner: owner.to_string(),
                created_at: now,
                modified_at: now,
                acl,
            },
        );
        self.touch_parent(&path);
    }

    fn object(&self, path: &Path) -> Result<&MemoryObject, BackendError> {
        self.objects
            .get(path)
            .ok_or_else(|| BackendError::NotFound(path.to_path_buf()))
    }

    /// Fails unless `path` is free and its parent is an existing collection
    fn check_new_child(&self, path: &Path) -> Result<(), BackendError> {
        if self.objects.contains_key(path) {
            return Err(BackendError::AlreadyExists(path.to_path_buf()));
        }
        let parent = path
            .parent()
            .ok_or_else(|| BackendError::AlreadyExists(path.to_path_buf()))?;
        let parent_object = self.object(parent)?;
        if !parent_object.kind.is_collection() {
            return Err(BackendError::NotACollection(parent.to_path_buf()));
        }
        Ok(())
    }

    fn is_admin(&self, user: &str) -> bool {
        self.users
            .get(user)
            .map(|u| u.user_type == UserType::Admin)
            .unwrap_or(false)
    }

    fn level_for(&self, user: &str, object: &MemoryObject) -> Option<PermissionLevel> {
        let groups = self.users.get(user).map(|u| &u.groups);
        object
            .acl
            .iter()
            .filter(|e| e.name == user || groups.map(|g| g.contains(&e.name)).unwrap_or(false))
            .map(|e| e.level)
            .max()
    }

    fn require(&self, user: &str, path: &Path, level: PermissionLevel) -> Result<(), BackendError> {
        let object = self.object(path)?;
        if self.is_admin(user) {
            return Ok(());
        }
        match self.level_for(user, object) {
            Some(held) if held >= level => Ok(()),
            _ => Err(BackendError::PermissionDenied(path.to_path_buf())),
        }
    }

    fn parent_of(path: &Path) -> Result<&Path, BackendError> {
        path.parent()
            .ok_or_else(|| BackendError::PermissionDenied(path.to_path_buf()))
    }

    fn has_children(&self, path: &Path) -> bool {
        self.objects.keys().any(|k| k.parent() == Some(path))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self, account: &Account) -> Result<Box<dyn Session>, BackendError> {
        {
            let store = self.inner.read();
            if !store.is_admin(&account.proxy_user) {
                return Err(BackendError::Connection(format!(
                    "proxy user {} is not an administrator",
                    account.proxy_user
                )));
            }
            if !store.users.contains_key(&account.client_user) {
                return Err(BackendError::UnknownAccount(account.client_user.clone()));
            }
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let open = self.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(user = %account.client_user, open, "opened session");
        Ok(Box::new(MemorySession {
            store: self.inner.clone(),
            user: account.client_user.clone(),
            open_sessions: self.open_sessions.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    store: Arc<RwLock<MemoryStore>>,
    user: String,
    open_sessions: Arc<AtomicUsize>,
    closed: AtomicBool,
}

#[async_trait]
impl Session for MemorySession {
    async fn stat(&self, path: &Path) -> Result<ObjStat, BackendError> {
        let store = self.store.read();
        let object = store.object(path)?;
        Ok(ObjStat {
            kind: object.kind,
            size: object.data.len() as u64,
            owner_name: object.owner.clone(),
            owner_zone: store.zone.clone(),
            created_at: object.created_at,
            modified_at: object.modified_at,
            object_id: Some(object.id),
        })
    }

    async fn list(&self, path: &Path) -> Result<Vec<ListingEntry>, BackendError> {
        let store = self.store.read();
        if !store.object(path)?.kind.is_collection() {
            return Err(BackendError::NotACollection(path.to_path_buf()));
        }
        store.require(&self.user, path, PermissionLevel::Read)?;

        Ok(store
            .objects
            .iter()
            .filter(|(k, _)| k.parent() == Some(path))
            .filter_map(|(k, v)| {
                let name = k.file_name()?.to_string_lossy().to_string();
                Some(ListingEntry { name, kind: v.kind })
            })
            .collect())
    }

    async fn create_data_object(&self, path: &Path, overwrite: bool) -> Result<(), BackendError> {
        let mut store = self.store.write();
        if let Some(existing) = store.objects.get(path) {
            if !overwrite || existing.kind != ObjectKind::DataObject {
                return Err(BackendError::AlreadyExists(path.to_path_buf()));
            }
            store.require(&self.user, path, PermissionLevel::Write)?;
            let now = store.tick();
            if let Some(object) = store.objects.get_mut(path) {
                object.data.clear();
                object.modified_at = now;
            }
            return Ok(());
        }

        store.check_new_child(path)?;
        store.require(&self.user, MemoryStore::parent_of(path)?, PermissionLevel::Write)?;
        let user = self.user.clone();
        store.insert_object(path.to_path_buf(), ObjectKind::DataObject, &user, Vec::new());
        Ok(())
    }

    async fn create_collection(&self, path: &Path) -> Result<(), BackendError> {
        let mut store = self.store.write();
        store.check_new_child(path)?;
        store.require(&self.user, MemoryStore::parent_of(path)?, PermissionLevel::Write)?;
        let user = self.user.clone();
        store.insert_object(path.to_path_buf(), ObjectKind::Collection, &user, Vec::new());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<(), BackendError> {
        let mut store = self.store.write();
        store.require(&self.user, path, PermissionLevel::Write)?;
        if store.has_children(path) {
            return Err(BackendError::NotEmpty(path.to_path_buf()));
        }
        store.objects.remove(path);
        store.touch_parent(path);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError> {
        let mut store = self.store.write();
        store.require(&self.user, from, PermissionLevel::Write)?;
        if store.objects.contains_key(to) {
            return Err(BackendError::AlreadyExists(to.to_path_buf()));
        }
        if to.starts_with(from) {
            return Err(BackendError::Other(format!(
                "cannot move {} into itself",
                from.display()
            )));
        }
        store.check_new_child(to)?;
        store.require(&self.user, MemoryStore::parent_of(to)?, PermissionLevel::Write)?;

        let moved: Vec<PathBuf> = store
            .objects
            .keys()
            .filter(|k| k.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            let Some(object) = store.objects.remove(&old) else {
                continue;
            };
            let rest = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            store.objects.insert(new, object);
        }

        store.touch_parent(from);
        store.touch_parent(to);
        Ok(())
    }

    async fn read(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, BackendError> {
        let store = self.store.read();
        let object = store.object(path)?;
        if object.kind.is_collection() {
            return Err(BackendError::IsACollection(path.to_path_buf()));
        }
        store.require(&self.user, path, PermissionLevel::Read)?;

        let start = usize::try_from(offset).map_or(object.data.len(), |o| o.min(object.data.len()));
        let end = start.saturating_add(len).min(object.data.len());
        Ok(object.data[start..end].to_vec())
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize, BackendError> {
        let mut store = self.store.write();
        if store.object(path)?.kind.is_collection() {
            return Err(BackendError::IsACollection(path.to_path_buf()));
        }
        store.require(&self.user, path, PermissionLevel::Write)?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_OBJECT_SIZE)
            .ok_or_else(|| BackendError::TooLarge(path.to_path_buf()))?;
        let (start, end) = (offset as usize, end as usize);

        let now = store.tick();
        let object = store
            .objects
            .get_mut(path)
            .ok_or_else(|| BackendError::NotFound(path.to_path_buf()))?;
        if object.data.len() < end {
            object.data.resize(end, 0);
        }
        object.data[start..end].copy_from_slice(data);
        object.modified_at = now;
        Ok(data.len())
    }

    async fn permissions(&self, path: &Path) -> Result<Vec<PermissionEntry>, BackendError> {
        let store = self.store.read();
        Ok(store.object(path)?.acl.clone())
    }

    async fn grant(&self, path: &Path, entry: &PermissionEntry) -> Result<(), BackendError> {
        let mut store = self.store.write();
        store.require(&self.user, path, PermissionLevel::Own)?;
        if !store.users.contains_key(&entry.name) {
            return Err(BackendError::UnknownAccount(entry.name.clone()));
        }
        let object = store
            .objects
            .get_mut(path)
            .ok_or_else(|| BackendError::NotFound(path.to_path_buf()))?;
        object.acl.retain(|e| !(e.name == entry.name && e.zone == entry.zone));
        object.acl.push(entry.clone());
        Ok(())
    }

    async fn revoke(&self, path: &Path, entry: &PermissionEntry) -> Result<(), BackendError> {
        let mut store = self.store.write();
        store.require(&self.user, path, PermissionLevel::Own)?;
        let object = store
            .objects
            .get_mut(path)
            .ok_or_else(|| BackendError::NotFound(path.to_path_buf()))?;
        object.acl.retain(|e| !(e.name == entry.name && e.zone == entry.zone));
        Ok(())
    }

    async fn find_user(&self, name: &str) -> Result<Option<BackendUser>, BackendError> {
        let store = self.store.read();
        Ok(store.users.get(name).map(|u| BackendUser {
            name: name.to_string(),
            zone: store.zone.clone(),
            user_type: u.user_type,
        }))
    }

    async fn user_groups(&self, name: &str) -> Result<Vec<String>, BackendError> {
        let store = self.store.read();
        let user = store
            .users
            .get(name)
            .ok_or_else(|| BackendError::UnknownAccount(name.to_string()))?;
        Ok(user.groups.iter().cloned().collect())
    }

    async fn users_with_metadata(
        &self,
        attribute: &str,
    ) -> Result<Vec<(String, String)>, BackendError> {
        let store = self.store.read();
        let mut pairs: Vec<(String, String)> = store
            .users
            .iter()
            .flat_map(|(name, user)| {
                user.metadata
                    .iter()
                    .filter(|(a, _)| a == attribute)
                    .map(move |(_, v)| (name.clone(), v.clone()))
            })
            .collect();
        pairs.sort();
        Ok(pairs)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
            tracing::trace!(user = %self.user, "closed session");
        }
    }
}
