//! Session-scoped access to the remote object store.
//!
//! Every call against the store happens through a [`Session`] opened for one
//! [`Account`]. Sessions are expensive and must not outlive the request that
//! opened them; [`SessionGuard`] closes the session when it goes out of scope.

mod memory;
mod types;

use std::ops::Deref;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub use memory::{MemoryBackend, MAX_OBJECT_SIZE};
pub use types::{
    Account, BackendUser, ListingEntry, ObjStat, ObjectKind, PermissionEntry, PermissionLevel,
    SubjectKind, UserType,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("path not found: {0}")]
    NotFound(PathBuf),
    #[error("path already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("collection is not empty: {0}")]
    NotEmpty(PathBuf),
    #[error("not a collection: {0}")]
    NotACollection(PathBuf),
    #[error("is a collection: {0}")]
    IsACollection(PathBuf),
    #[error("object would exceed the size limit: {0}")]
    TooLarge(PathBuf),
    #[error("permission denied on {0}")]
    PermissionDenied(PathBuf),
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("backend error: {0}")]
    Other(String),
}

/// Opens sessions against the store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Authenticate as the account's proxy user and act as its client user.
    async fn connect(&self, account: &Account) -> Result<Box<dyn Session>, BackendError>;
}

/// Operations available on an open connection.
///
/// All paths are absolute, zone-rooted store paths.
#[async_trait]
pub trait Session: Send + Sync {
    async fn stat(&self, path: &Path) -> Result<ObjStat, BackendError>;

    /// List the immediate children of a collection
    async fn list(&self, path: &Path) -> Result<Vec<ListingEntry>, BackendError>;

    /// Create an empty data object. With `overwrite` an existing object is truncated.
    async fn create_data_object(&self, path: &Path, overwrite: bool) -> Result<(), BackendError>;

    async fn create_collection(&self, path: &Path) -> Result<(), BackendError>;

    /// Remove a data object or an empty collection
    async fn remove(&self, path: &Path) -> Result<(), BackendError>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), BackendError>;

    async fn read(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, BackendError>;

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize, BackendError>;

    async fn permissions(&self, path: &Path) -> Result<Vec<PermissionEntry>, BackendError>;

    /// Grant `entry` on `path`, replacing any level the subject already held
    async fn grant(&self, path: &Path, entry: &PermissionEntry) -> Result<(), BackendError>;

    /// Remove whatever level `entry`'s subject holds on `path`
    async fn revoke(&self, path: &Path, entry: &PermissionEntry) -> Result<(), BackendError>;

    /// Look up an account or group by name
    async fn find_user(&self, name: &str) -> Result<Option<BackendUser>, BackendError>;

    /// Names of the groups `name` belongs to
    async fn user_groups(&self, name: &str) -> Result<Vec<String>, BackendError>;

    /// `(account, value)` pairs for every account or group carrying `attribute`
    async fn users_with_metadata(
        &self,
        attribute: &str,
    ) -> Result<Vec<(String, String)>, BackendError>;

    /// Release the connection. Must be safe to call from `Drop`.
    fn close(&self);
}

/// Owns a session for the duration of one request and closes it on drop,
///  whichever way the request exits.
pub struct SessionGuard {
    session: Box<dyn Session>,
}

impl SessionGuard {
    pub async fn open(backend: &dyn Backend, account: &Account) -> Result<Self, BackendError> {
        let session = backend.connect(account).await?;
        Ok(Self { session })
    }
}

impl Deref for SessionGuard {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}
