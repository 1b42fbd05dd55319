use std::path::Path;

use common::prelude::BackendError;

use super::inode_map::InodeMapError;

/// Failures surfaced to the protocol engine.
///
/// Each variant maps onto one POSIX error code through [`VfsError::errno`].
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("collection not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("unknown principal: uid {0}")]
    UnknownPrincipal(u32),

    #[error("backend failure: {0}")]
    Backend(BackendError),

    #[error("handle registry out of sync with backend: {0}")]
    Invariant(#[from] InodeMapError),
}

impl VfsError {
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::AlreadyExists(_) => libc::EEXIST,
            VfsError::PermissionDenied(_) => libc::EACCES,
            VfsError::Unsupported(_) => libc::ENOTSUP,
            VfsError::NotEmpty(_) => libc::ENOTEMPTY,
            VfsError::NotADirectory(_) => libc::ENOTDIR,
            VfsError::IsADirectory(_) => libc::EISDIR,
            VfsError::FileTooLarge(_) => libc::EFBIG,
            VfsError::UnknownPrincipal(_) => libc::EPERM,
            VfsError::Backend(_) => libc::EIO,
            VfsError::Invariant(_) => libc::EIO,
        }
    }

    pub(crate) fn handle_not_found(handle: u64) -> Self {
        VfsError::NotFound(format!("handle {}", handle))
    }
}

impl From<BackendError> for VfsError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(p) => VfsError::NotFound(p.display().to_string()),
            BackendError::AlreadyExists(p) => VfsError::AlreadyExists(p.display().to_string()),
            BackendError::NotEmpty(p) => VfsError::NotEmpty(p.display().to_string()),
            BackendError::PermissionDenied(p) => {
                VfsError::PermissionDenied(p.display().to_string())
            }
            BackendError::NotACollection(p) => VfsError::NotADirectory(p.display().to_string()),
            BackendError::IsACollection(p) => VfsError::IsADirectory(p.display().to_string()),
            BackendError::TooLarge(p) => VfsError::FileTooLarge(p.display().to_string()),
            other => VfsError::Backend(other),
        }
    }
}

/// Attach the failing operation and path to backend errors, logging the
///  ones that end up as generic I/O failures.
pub(crate) trait BackendContext<T> {
    fn context(self, op: &'static str, path: &Path) -> Result<T, VfsError>;
}

impl<T> BackendContext<T> for Result<T, BackendError> {
    fn context(self, op: &'static str, path: &Path) -> Result<T, VfsError> {
        self.map_err(|err| {
            let err = VfsError::from(err);
            if let VfsError::Backend(inner) = &err {
                tracing::error!(op, path = %path.display(), error = %inner, "backend call failed");
            }
            err
        })
    }
}
