//! Numeric principal to backend account resolution
//!
//! The protocol engine hands us a uid; the backend wants a proxied account.
//! Resolution goes through an [`IdentitySource`] (normally the system account
//! database) and is cached until that source changes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::unistd::{Gid, Group, Uid, User};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;

use common::prelude::{Account, Backend, BackendError, SessionGuard};

use super::error::VfsError;

/// Reserved ids for principals we cannot map
pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;

const ACCOUNT_DATABASE_FILES: [&str; 3] = ["/etc/passwd", "/etc/shadow", "/etc/group"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemGroup {
    pub name: String,
    pub gid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity lookup failed: {0}")]
    Lookup(String),
}

/// Where uid/gid and name bindings come from
pub trait IdentitySource: Send + Sync + 'static {
    fn user_by_uid(&self, uid: u32) -> Result<Option<SystemUser>, IdentityError>;
    fn user_by_name(&self, name: &str) -> Result<Option<SystemUser>, IdentityError>;
    fn group_by_name(&self, name: &str) -> Result<Option<SystemGroup>, IdentityError>;
    fn group_by_gid(&self, gid: u32) -> Result<Option<SystemGroup>, IdentityError>;

    /// Values that change whenever any binding may have changed
    fn modification_markers(&self) -> Vec<Option<SystemTime>>;
}

/// The host's account database, via `getpwuid(3)` and friends.
#[derive(Debug, Default)]
pub struct SystemIdentitySource;

impl IdentitySource for SystemIdentitySource {
    fn user_by_uid(&self, uid: u32) -> Result<Option<SystemUser>, IdentityError> {
        let user = User::from_uid(Uid::from_raw(uid)).map_err(|e| IdentityError::Lookup(e.to_string()))?;
        Ok(user.map(system_user))
    }

    fn user_by_name(&self, name: &str) -> Result<Option<SystemUser>, IdentityError> {
        let user = User::from_name(name).map_err(|e| IdentityError::Lookup(e.to_string()))?;
        Ok(user.map(system_user))
    }

    fn group_by_name(&self, name: &str) -> Result<Option<SystemGroup>, IdentityError> {
        let group = Group::from_name(name).map_err(|e| IdentityError::Lookup(e.to_string()))?;
        Ok(group.map(system_group))
    }

    fn group_by_gid(&self, gid: u32) -> Result<Option<SystemGroup>, IdentityError> {
        let group = Group::from_gid(Gid::from_raw(gid)).map_err(|e| IdentityError::Lookup(e.to_string()))?;
        Ok(group.map(system_group))
    }

    fn modification_markers(&self) -> Vec<Option<SystemTime>> {
        ACCOUNT_DATABASE_FILES
            .iter()
            .map(|file| {
                std::fs::metadata(Path::new(file))
                    .and_then(|m| m.modified())
                    .ok()
            })
            .collect()
    }
}

fn system_user(user: User) -> SystemUser {
    SystemUser {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
    }
}

fn system_group(group: Group) -> SystemGroup {
    SystemGroup {
        name: group.name,
        gid: group.gid.as_raw(),
    }
}

#[derive(Debug, Default)]
struct StaticTables {
    users: Vec<SystemUser>,
    groups: Vec<SystemGroup>,
    generation: u64,
}

/// Fixed in-memory bindings, for tests and for running without a real
///  account database. Every mutation counts as a modification.
#[derive(Debug, Default)]
pub struct StaticIdentitySource {
    tables: RwLock<StaticTables>,
}

impl StaticIdentitySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, name: &str, uid: u32, gid: u32) -> Self {
        self.add_user(name, uid, gid);
        self
    }

    pub fn with_group(self, name: &str, gid: u32) -> Self {
        self.add_group(name, gid);
        self
    }

    pub fn add_user(&self, name: &str, uid: u32, gid: u32) {
        let mut tables = self.tables.write();
        tables.users.retain(|u| u.uid != uid && u.name != name);
        tables.users.push(SystemUser {
            name: name.to_string(),
            uid,
            gid,
        });
        tables.generation += 1;
    }

    pub fn add_group(&self, name: &str, gid: u32) {
        let mut tables = self.tables.write();
        tables.groups.retain(|g| g.gid != gid && g.name != name);
        tables.groups.push(SystemGroup {
            name: name.to_string(),
            gid,
        });
        tables.generation += 1;
    }

    pub fn remove_user(&self, uid: u32) {
        let mut tables = self.tables.write();
        tables.users.retain(|u| u.uid != uid);
        tables.generation += 1;
    }
}

impl IdentitySource for StaticIdentitySource {
    fn user_by_uid(&self, uid: u32) -> Result<Option<SystemUser>, IdentityError> {
        Ok(self.tables.read().users.iter().find(|u| u.uid == uid).cloned())
    }

    fn user_by_name(&self, name: &str) -> Result<Option<SystemUser>, IdentityError> {
        Ok(self.tables.read().users.iter().find(|u| u.name == name).cloned())
    }

    fn group_by_name(&self, name: &str) -> Result<Option<SystemGroup>, IdentityError> {
        Ok(self.tables.read().groups.iter().find(|g| g.name == name).cloned())
    }

    fn group_by_gid(&self, gid: u32) -> Result<Option<SystemGroup>, IdentityError> {
        Ok(self.tables.read().groups.iter().find(|g| g.gid == gid).cloned())
    }

    fn modification_markers(&self) -> Vec<Option<SystemTime>> {
        let generation = self.tables.read().generation;
        vec![Some(SystemTime::UNIX_EPOCH + Duration::from_secs(generation))]
    }
}

/// A principal bound to the backend account that acts for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub account: Account,
}

type UserSlot = Arc<OnceCell<Arc<ResolvedUser>>>;

/// Caches uid to account resolution.
///
/// Each uid gets a slot inserted under the write lock and initialised
/// outside it, so concurrent callers for the same uid share one backend
/// round trip. The proxy admin is always resolvable at uid 0.
pub struct IdMapper {
    backend: Arc<dyn Backend>,
    identities: Arc<dyn IdentitySource>,
    admin: Account,
    users: RwLock<HashMap<u32, UserSlot>>,
    markers: Mutex<Vec<Option<SystemTime>>>,
}

impl IdMapper {
    /// `admin` is the proxy account; its `client_user` is the proxy itself.
    pub fn new(
        backend: Arc<dyn Backend>,
        identities: Arc<dyn IdentitySource>,
        admin: Account,
    ) -> Self {
        let admin = admin.acting_as(admin.proxy_user.clone());
        let markers = identities.modification_markers();
        let mut users = HashMap::new();
        seed_admin(&mut users, &admin);

        Self {
            backend,
            identities,
            admin,
            users: RwLock::new(users),
            markers: Mutex::new(markers),
        }
    }

    pub fn admin_account(&self) -> &Account {
        &self.admin
    }

    /// Resolve `uid` to a backend account, at most once per cache generation
    pub async fn resolve(&self, uid: u32) -> Result<Arc<ResolvedUser>, VfsError> {
        let cached = self
            .users
            .read()
            .get(&uid)
            .and_then(|slot| slot.get().cloned());
        if let Some(user) = cached {
            return Ok(user);
        }

        let slot = self
            .users
            .write()
            .entry(uid)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        match slot.get_or_try_init(|| self.load(uid)).await {
            Ok(user) => Ok(user.clone()),
            Err(e) => {
                // failed lookups leave no slot behind
                let mut users = self.users.write();
                if users
                    .get(&uid)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
                {
                    users.remove(&uid);
                }
                Err(e)
            }
        }
    }

    /// Resolved principal with this account name, if one is cached
    fn cached_by_name(&self, name: &str) -> Option<Arc<ResolvedUser>> {
        self.users
            .read()
            .values()
            .filter_map(|slot| slot.get())
            .find(|user| user.name == name)
            .cloned()
    }

    async fn load(&self, uid: u32) -> Result<Arc<ResolvedUser>, VfsError> {
        let system = self
            .identities
            .user_by_uid(uid)
            .map_err(|e| {
                tracing::warn!(uid, error = %e, "identity lookup failed");
                VfsError::UnknownPrincipal(uid)
            })?
            .ok_or(VfsError::UnknownPrincipal(uid))?;

        let account = self.admin.acting_as(system.name.clone());
        let unknown = |e: BackendError| match e {
            BackendError::UnknownAccount(_) => VfsError::UnknownPrincipal(uid),
            other => VfsError::from(other),
        };
        {
            let session = SessionGuard::open(self.backend.as_ref(), &account)
                .await
                .map_err(unknown)?;
            if session.find_user(&system.name).await.map_err(unknown)?.is_none() {
                return Err(VfsError::UnknownPrincipal(uid));
            }
        }

        tracing::debug!(uid, name = %system.name, "resolved principal");
        Ok(Arc::new(ResolvedUser {
            name: system.name,
            uid: system.uid,
            gid: system.gid,
            account,
        }))
    }

    pub fn uid_for_name(&self, name: &str) -> u32 {
        self.ids_for_name(name).0
    }

    /// uid and primary gid for an account name, nobody when unknown
    pub fn ids_for_name(&self, name: &str) -> (u32, u32) {
        if name == self.admin.proxy_user {
            return (0, 0);
        }
        if let Some(user) = self.cached_by_name(name) {
            return (user.uid, user.gid);
        }
        match self.identities.user_by_name(name) {
            Ok(Some(user)) => (user.uid, user.gid),
            Ok(None) => (NOBODY_UID, NOBODY_GID),
            Err(e) => {
                tracing::warn!(name, error = %e, "identity lookup failed");
                (NOBODY_UID, NOBODY_GID)
            }
        }
    }

    pub fn gid_for_name(&self, name: &str) -> u32 {
        match self.identities.group_by_name(name) {
            Ok(Some(group)) => group.gid,
            _ => NOBODY_GID,
        }
    }

    pub fn name_for_uid(&self, uid: u32) -> Option<String> {
        if uid == 0 {
            return Some(self.admin.proxy_user.clone());
        }
        self.identities.user_by_uid(uid).ok().flatten().map(|u| u.name)
    }

    pub fn name_for_gid(&self, gid: u32) -> Option<String> {
        self.identities.group_by_gid(gid).ok().flatten().map(|g| g.name)
    }

    /// Drop every resolved principal if the identity source changed since
    ///  the last check. Returns whether a purge happened.
    pub fn purge_if_changed(&self) -> bool {
        let current = self.identities.modification_markers();
        {
            let mut last = self.markers.lock();
            if *last == current {
                return false;
            }
            *last = current;
        }

        let mut users = self.users.write();
        users.clear();
        seed_admin(&mut users, &self.admin);
        tracing::info!("identity source changed, cleared resolved principals");
        true
    }

    /// Number of principals currently cached, the admin included
    pub fn cached_principals(&self) -> usize {
        self.users.read().len()
    }

    /// Poll the identity source every `interval` until shutdown
    pub fn spawn_purge_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        let mapper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        mapper.purge_if_changed();
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("identity purge task stopping");
                        break;
                    }
                }
            }
        })
    }
}

fn seed_admin(users: &mut HashMap<u32, UserSlot>, admin: &Account) {
    let resolved = ResolvedUser {
        name: admin.proxy_user.clone(),
        uid: 0,
        gid: 0,
        account: admin.clone(),
    };
    users.insert(0, Arc::new(OnceCell::new_with(Some(Arc::new(resolved)))));
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use common::prelude::{MemoryBackend, UserType};

    use super::*;

    fn admin() -> Account {
        Account {
            host: "localhost".into(),
            port: 1247,
            zone: "tempZone".into(),
            default_resource: "demoResc".into(),
            proxy_user: "rods".into(),
            proxy_password: "rods".into(),
            client_user: "rods".into(),
            home: PathBuf::from("/tempZone/home"),
        }
    }

    fn setup() -> (MemoryBackend, Arc<StaticIdentitySource>, Arc<IdMapper>) {
        let backend = MemoryBackend::new("tempZone", "rods");
        backend.add_user("alice", UserType::Regular);
        let identities = Arc::new(
            StaticIdentitySource::new()
                .with_user("alice", 1000, 1000)
                .with_user("ghost", 1001, 1001),
        );
        let mapper = Arc::new(IdMapper::new(
            Arc::new(backend.clone()),
            identities.clone(),
            admin(),
        ));
        (backend, identities, mapper)
    }

    #[tokio::test]
    async fn test_admin_is_preseeded() {
        let (backend, _, mapper) = setup();
        let user = mapper.resolve(0).await.unwrap();
        assert_eq!(user.name, "rods");
        assert_eq!(backend.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_once_per_generation() {
        let (backend, _, mapper) = setup();
        let first = mapper.resolve(1000).await.unwrap();
        let second = mapper.resolve(1000).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.account.client_user, "alice");
        assert_eq!(backend.connect_count(), 1);
        assert_eq!(backend.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_shares_one_lookup() {
        let (backend, _, mapper) = setup();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mapper = mapper.clone();
                tokio::spawn(async move { mapper.resolve(1000).await.map(|u| u.uid) })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            assert_eq!(task.unwrap().unwrap(), 1000);
        }
        assert_eq!(backend.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_principals() {
        let (_, _, mapper) = setup();
        // no system account
        assert!(matches!(
            mapper.resolve(4242).await,
            Err(VfsError::UnknownPrincipal(4242))
        ));
        // system account without a backend account
        assert!(matches!(
            mapper.resolve(1001).await,
            Err(VfsError::UnknownPrincipal(1001))
        ));
        assert_eq!(mapper.uid_for_name("nobody-here"), NOBODY_UID);
        assert_eq!(mapper.gid_for_name("nobody-here"), NOBODY_GID);
    }

    #[tokio::test]
    async fn test_failed_resolution_not_cached() {
        let (_, _, mapper) = setup();
        assert!(mapper.resolve(4242).await.is_err());
        assert!(mapper.resolve(1001).await.is_err());
        assert_eq!(mapper.cached_principals(), 1);
    }

    #[tokio::test]
    async fn test_name_lookup_served_from_resolved_users() {
        let (_, identities, mapper) = setup();
        assert_eq!(mapper.ids_for_name("alice"), (1000, 1000));
        mapper.resolve(1000).await.unwrap();

        // gone from the identity source, still cached until the next purge
        identities.remove_user(1000);
        assert_eq!(mapper.ids_for_name("alice"), (1000, 1000));
        assert_eq!(mapper.uid_for_name("ghost"), 1001);

        assert!(mapper.purge_if_changed());
        assert_eq!(mapper.ids_for_name("alice"), (NOBODY_UID, NOBODY_GID));
    }

    #[tokio::test]
    async fn test_purge_on_identity_change() {
        let (backend, identities, mapper) = setup();
        mapper.resolve(1000).await.unwrap();
        assert_eq!(mapper.cached_principals(), 2);
        assert!(!mapper.purge_if_changed());

        identities.add_user("bob", 1002, 1002);
        assert!(mapper.purge_if_changed());
        assert_eq!(mapper.cached_principals(), 1);
        assert_eq!(mapper.resolve(0).await.unwrap().name, "rods");

        mapper.resolve(1000).await.unwrap();
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_purge_task_stops_on_shutdown() {
        let (_, _, mapper) = setup();
        let (tx, rx) = watch::channel(());
        let task = mapper.spawn_purge_task(Duration::from_millis(10), rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
