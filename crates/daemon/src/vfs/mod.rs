/**
 * Adapter between the handle-based protocol engine and the
 *  session-based object store.
 */
pub mod acl;
pub mod allowlist;
pub mod cache;
pub mod error;
pub mod id_mapper;
pub mod inode_map;
pub mod nfs_vfs;

pub use acl::{AccessDecision, Ace, AceFlags, AceMask, AceType};
pub use allowlist::{AclAllowlist, DEFAULT_ALLOWLIST_ATTRIBUTE};
pub use cache::{CacheTtls, VfsCache};
pub use error::VfsError;
pub use id_mapper::{
    IdMapper, IdentitySource, ResolvedUser, StaticIdentitySource, SystemIdentitySource,
    NOBODY_GID, NOBODY_UID,
};
pub use inode_map::{Handle, InodeMap, InodeMapError, ROOT_HANDLE};
pub use nfs_vfs::{
    DirEntry, FileAttributes, FileType, FsStat, NfsVfs, SetAttributes, Stability, VfsOptions,
    FIRST_ENTRY_COOKIE,
};
