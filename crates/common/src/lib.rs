/**
 * Client-side view of the remote object store.
 *  - Domain types (collections, data objects, permissions)
 *  - The session-scoped `Backend` / `Session` traits
 *  - An in-memory store used by tests and local runs
 */
pub mod backend;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::backend::{
        Account, Backend, BackendError, BackendUser, ListingEntry, MemoryBackend, ObjStat,
        ObjectKind, PermissionEntry, PermissionLevel, Session, SessionGuard, SubjectKind,
        UserType,
    };
    pub use crate::version::build_info;
}
