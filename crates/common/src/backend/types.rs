use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a path in the store refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A directory-like container
    Collection,
    /// A file-like object holding bytes
    DataObject,
    /// A collection the server reports without a catalog entry of its own,
    ///  e.g. the zone root when the caller cannot see it.
    SyntheticCollection,
}

impl ObjectKind {
    pub fn is_collection(&self) -> bool {
        matches!(self, ObjectKind::Collection | ObjectKind::SyntheticCollection)
    }
}

/// Result of a stat-by-path against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjStat {
    pub kind: ObjectKind,
    pub size: u64,
    pub owner_name: String,
    pub owner_zone: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// The store's durable identifier for the object, when it has one
    pub object_id: Option<u64>,
}

/// One child returned by a collection listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingEntry {
    pub name: String,
    pub kind: ObjectKind,
}

/// Whether a permission names an account or a group of accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKind {
    Individual,
    Group,
}

/// Permission levels the store understands, ordered weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionLevel {
    Read,
    Write,
    Own,
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionLevel::Read => write!(f, "read"),
            PermissionLevel::Write => write!(f, "write"),
            PermissionLevel::Own => write!(f, "own"),
        }
    }
}

/// A single grant attached to a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub name: String,
    pub kind: SubjectKind,
    pub zone: String,
    pub level: PermissionLevel,
}

impl PermissionEntry {
    pub fn new(
        name: impl Into<String>,
        kind: SubjectKind,
        zone: impl Into<String>,
        level: PermissionLevel,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            zone: zone.into(),
            level,
        }
    }
}

/// Account classification as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    Admin,
    Regular,
    Group,
}

/// An account (or group) known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUser {
    pub name: String,
    pub zone: String,
    pub user_type: UserType,
}

/// Credentials for a proxied connection: the proxy admin authenticates and
///  the session then acts as `client_user`.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub default_resource: String,
    pub proxy_user: String,
    pub proxy_password: String,
    pub client_user: String,
    pub home: PathBuf,
}

impl Account {
    /// Same connection parameters, acting as a different user.
    pub fn acting_as(&self, client_user: impl Into<String>) -> Self {
        Self {
            client_user: client_user.into(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("zone", &self.zone)
            .field("proxy_user", &self.proxy_user)
            .field("client_user", &self.client_user)
            .finish_non_exhaustive()
    }
}
