//! Object-store client abstraction.
//!
//! The filesystem core talks to the backend exclusively through
//! [`ObjectStore`]; transports (HTTP, auth, retries) live behind it. The
//! in-memory implementation in [`mem`] backs unit tests and the demo mount.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

pub mod mem;

pub use mem::MemStore;

/// Object metadata headers, as returned by HEAD and listing calls.
pub type Headers = HashMap<String, String>;

/// Marks a large object: `<container>/<prefix>` naming the segments that make
/// up its body.
pub const MANIFEST_HEADER: &str = "X-Object-Manifest";
/// Common prefix of user metadata headers.
pub const OBJECT_META_PREFIX: &str = "X-Object-Meta-";
pub const SYMLINK_HEADER: &str = "X-Object-Meta-Symlink-Target";
/// Float seconds since the epoch; overrides the transport mtime.
pub const MTIME_HEADER: &str = "X-Object-Meta-Mtime";
/// Pre-encryption byte size of an encrypted object.
pub const ORIGIN_SIZE_HEADER: &str = "X-Object-Meta-Crypto-Origin-Size";
pub const NONCE_HEADER: &str = "X-Object-Meta-Crypto-Nonce";
/// Asks the backend to sniff the content type on create.
pub const AUTO_CONTENT_HEADER: &str = "X-Detect-Content-Type";

pub const DIR_CONTENT_TYPE: &str = "application/directory";
pub const OBJ_CONTENT_TYPE: &str = "application/octet-stream";
pub const LINK_CONTENT_TYPE: &str = "application/link";

/// A single entry from a container listing or a HEAD request.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Full object name within its container.
    pub name: String,
    pub bytes: u64,
    pub content_type: String,
    pub last_modified: SystemTime,
    /// Set by the backend for common-prefix entries synthesized during a
    /// delimiter listing. Such entries have no backing object.
    pub pseudo_directory: bool,
}

impl Entry {
    /// A synthetic entry for an object created moments ago by this process.
    pub fn synthetic(name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Entry {
            name: name.into(),
            bytes: 0,
            content_type: content_type.into(),
            last_modified: SystemTime::now(),
            pseudo_directory: false,
        }
    }
}

/// Listing options: prefix filtering and common-prefix collapsing.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    pub delimiter: Option<char>,
}

impl ListOptions {
    pub fn prefixed(prefix: impl Into<String>, delimiter: char) -> Self {
        ListOptions {
            prefix: prefix.into(),
            delimiter: Some(delimiter),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {container}/{path}")]
    NotFound { container: String, path: String },
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(container: &str, path: &str) -> Self {
        StoreError::NotFound {
            container: container.to_string(),
            path: path.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::ContainerNotFound(_)
        )
    }
}

/// Seekable object reader. Manifest objects read as the concatenation of
/// their segments in lexicographic name order.
pub trait ObjectReader: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Sync + Unpin> ObjectReader for T {}

/// Streaming object writer returned by [`ObjectStore::object_create`].
/// Nothing is visible in the store until `close` commits the stream.
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), StoreError>;
    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// The operations the filesystem issues against the backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create or replace an object in one call.
    async fn object_put_bytes(
        &self,
        container: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// Open a streaming create. `check_hash`/`hash` request server-side
    /// integrity verification where the transport supports it.
    async fn object_create(
        &self,
        container: &str,
        path: &str,
        check_hash: bool,
        hash: &str,
        content_type: &str,
        headers: Headers,
    ) -> Result<Box<dyn ObjectWriter>, StoreError>;

    /// List objects, collapsing common prefixes when a delimiter is given.
    async fn objects_all(
        &self,
        container: &str,
        opts: &ListOptions,
    ) -> Result<Vec<Entry>, StoreError>;

    /// HEAD: full metadata and headers for one object.
    async fn object(&self, container: &str, path: &str) -> Result<(Entry, Headers), StoreError>;

    /// Open an object for seekable reading.
    async fn object_open(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Box<dyn ObjectReader>, StoreError>;

    /// Rewrite object metadata headers without touching the body.
    async fn object_update(
        &self,
        container: &str,
        path: &str,
        headers: Headers,
    ) -> Result<(), StoreError>;

    /// Server-side move, possibly across containers.
    async fn object_move(
        &self,
        src_container: &str,
        src_path: &str,
        dst_container: &str,
        dst_path: &str,
    ) -> Result<(), StoreError>;

    /// Copy a manifest object, preserving its segment references. The source
    /// is left in place; callers delete it separately.
    async fn manifest_copy(
        &self,
        src_container: &str,
        src_path: &str,
        dst_container: &str,
        dst_path: &str,
        headers: Option<Headers>,
    ) -> Result<(), StoreError>;

    async fn object_delete(&self, container: &str, path: &str) -> Result<(), StoreError>;
}
