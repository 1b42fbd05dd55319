use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use common::prelude::{Account, Backend, BackendError, SessionGuard};

/// Metadata attribute marking accounts allowed to read and write ACLs
///  below a path prefix
pub const DEFAULT_ALLOWLIST_ATTRIBUTE: &str = "irods::nfsrods::grant_nfs4_setfacl";

/// Accounts and groups granted ACL access outside normal ownership.
///
/// The table is rebuilt from account metadata; the backend query runs
/// without the lock and the write lock only covers the swap.
pub struct AclAllowlist {
    backend: Arc<dyn Backend>,
    admin: Account,
    attribute: String,
    prefixes: RwLock<HashMap<String, Vec<PathBuf>>>,
}

impl AclAllowlist {
    pub fn new(backend: Arc<dyn Backend>, admin: Account, attribute: impl Into<String>) -> Self {
        Self {
            backend,
            admin,
            attribute: attribute.into(),
            prefixes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn refresh(&self) -> Result<(), BackendError> {
        let pairs = {
            let session = SessionGuard::open(self.backend.as_ref(), &self.admin).await?;
            session.users_with_metadata(&self.attribute).await?
        };

        let mut table: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for (name, prefix) in pairs {
            table.entry(name).or_default().push(PathBuf::from(prefix));
        }
        let count = table.len();
        *self.prefixes.write() = table;

        tracing::debug!(subjects = count, "refreshed ACL allow-list");
        Ok(())
    }

    /// Whether `user`, or one of `groups`, holds a prefix covering `path`
    pub fn is_allowed(&self, user: &str, groups: &[String], path: &Path) -> bool {
        let prefixes = self.prefixes.read();
        std::iter::once(user)
            .chain(groups.iter().map(String::as_str))
            .filter_map(|subject| prefixes.get(subject))
            .flatten()
            .any(|prefix| path.starts_with(prefix))
    }

    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        let allowlist = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = allowlist.refresh().await {
                            tracing::warn!(error = %e, "allow-list refresh failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("allow-list refresh task stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
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

    #[tokio::test]
    async fn test_refresh_and_prefix_match() {
        let backend = MemoryBackend::new("tempZone", "rods");
        backend.add_user("alice", UserType::Regular);
        backend.add_user("bob", UserType::Regular);
        backend.add_group("stewards", &["bob"]);
        backend.set_user_metadata("alice", DEFAULT_ALLOWLIST_ATTRIBUTE, "/tempZone/public");
        backend.set_user_metadata("stewards", DEFAULT_ALLOWLIST_ATTRIBUTE, "/tempZone/home/carol");

        let allowlist = AclAllowlist::new(Arc::new(backend.clone()), admin(), DEFAULT_ALLOWLIST_ATTRIBUTE);
        assert!(!allowlist.is_allowed("alice", &[], Path::new("/tempZone/public/x")));

        allowlist.refresh().await.unwrap();
        assert_eq!(backend.open_sessions(), 0);

        assert!(allowlist.is_allowed("alice", &[], Path::new("/tempZone/public/x")));
        assert!(!allowlist.is_allowed("alice", &[], Path::new("/tempZone/publicity")));
        assert!(!allowlist.is_allowed("bob", &[], Path::new("/tempZone/home/carol/f")));
        assert!(allowlist.is_allowed(
            "bob",
            &["stewards".to_string()],
            Path::new("/tempZone/home/carol/f")
        ));
    }

    #[tokio::test]
    async fn test_refresh_replaces_table() {
        let backend = MemoryBackend::new("tempZone", "rods");
        backend.add_user("alice", UserType::Regular);
        backend.set_user_metadata("alice", DEFAULT_ALLOWLIST_ATTRIBUTE, "/tempZone/public");
        let allowlist = AclAllowlist::new(Arc::new(backend.clone()), admin(), DEFAULT_ALLOWLIST_ATTRIBUTE);
        allowlist.refresh().await.unwrap();

        backend.remove_user_metadata("alice", DEFAULT_ALLOWLIST_ATTRIBUTE);
        allowlist.refresh().await.unwrap();
        assert!(!allowlist.is_allowed("alice", &[], Path::new("/tempZone/public/x")));
    }
}
