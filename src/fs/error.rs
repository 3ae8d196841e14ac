//! Filesystem error taxonomy and errno mapping.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("entry not found")]
    NotFound,
    #[error("operation not supported")]
    NotSupported,
    /// A manifest pointer failed validation during removal. Never
    /// auto-repaired; segments are left untouched.
    #[error("invalid segment path for manifest {0}")]
    InvalidManifest(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            FsError::NotFound
        } else {
            FsError::Store(err)
        }
    }
}

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::InvalidManifest(_) => libc::EIO,
            FsError::Store(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
