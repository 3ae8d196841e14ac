//! Filesystem core: the node graph between the kernel dispatcher and the
//! object store.
//!
//! Nodes come in three kinds (directory, object, symlink) and share one
//! [`FsCore`]: the store client, the directory/change caches, the enrichment
//! lister, and the mount configuration. The core is injected into every node
//! instead of living in globals, so tests stay isolated and several mounts
//! can share a process.

use std::sync::Arc;
use std::time::SystemTime;

use log::warn;

use crate::config::Config;
use crate::store::{ListOptions, ObjectStore};

pub mod cache;
pub mod directory;
pub mod error;
pub mod handle;
pub mod lister;
pub mod naming;
pub mod object;
pub mod symlink;

pub use cache::{ChangeCache, DirectoryCache};
pub use directory::Directory;
pub use error::{FsError, Result};
pub use handle::ObjectHandle;
pub use lister::Lister;
pub use object::Object;
pub use symlink::Symlink;

/// Shared state of one mounted volume.
pub struct FsCore {
    pub store: Arc<dyn ObjectStore>,
    pub cache: DirectoryCache,
    pub changes: ChangeCache,
    pub lister: Lister,
    pub config: Config,
    /// User-visible keyspace.
    pub container: String,
    /// Backing keyspace for large-object segments.
    pub segments_container: String,
}

impl FsCore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: Config,
        container: &str,
        segments_container: &str,
    ) -> Arc<Self> {
        let lister = Lister::new(store.clone(), config.lister_concurrency);
        Arc::new(FsCore {
            store,
            cache: DirectoryCache::new(),
            changes: ChangeCache::new(),
            lister,
            config,
            container: container.to_string(),
            segments_container: segments_container.to_string(),
        })
    }
}

/// One mounted volume: shared core plus the apex directory.
pub struct ObjFs {
    core: Arc<FsCore>,
    root: Arc<Directory>,
}

impl ObjFs {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: Config,
        container: &str,
        segments_container: &str,
    ) -> Self {
        let core = FsCore::new(store, config, container, segments_container);
        let root = Directory::apex(core.clone());
        ObjFs { core, root }
    }

    pub fn root(&self) -> Arc<Directory> {
        self.root.clone()
    }

    pub fn core(&self) -> Arc<FsCore> {
        self.core.clone()
    }
}

/// Direntry type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// What readdir emits for one child.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Synthesized attributes of a node; the kernel glue translates these into
/// its own reply types.
#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub block_size: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// A node visible through the directory cache. A sealed sum rather than a
/// trait object: the cache and the dispatcher both need to branch on the
/// concrete kind.
#[derive(Clone)]
pub enum Node {
    Directory(Arc<Directory>),
    Object(Arc<Object>),
    Symlink(Arc<Symlink>),
}

impl Node {
    pub fn name(&self) -> String {
        match self {
            Node::Directory(d) => d.name(),
            Node::Object(o) => o.name(),
            Node::Symlink(s) => s.name(),
        }
    }

    /// Path identity within the container. Directory paths end in `/`.
    pub fn path(&self) -> String {
        match self {
            Node::Directory(d) => d.path(),
            Node::Object(o) => o.path(),
            Node::Symlink(s) => s.path(),
        }
    }

    pub fn container(&self) -> String {
        match self {
            Node::Directory(d) => d.container().to_string(),
            Node::Object(o) => o.container().to_string(),
            Node::Symlink(s) => s.container().to_string(),
        }
    }

    pub fn export(&self) -> DirEntry {
        DirEntry {
            name: self.name(),
            kind: match self {
                Node::Directory(_) => EntryKind::Directory,
                Node::Object(_) => EntryKind::File,
                Node::Symlink(_) => EntryKind::Symlink,
            },
        }
    }

    pub fn attr(&self) -> Attr {
        match self {
            Node::Directory(d) => d.attr(),
            Node::Object(o) => o.attr(),
            Node::Symlink(s) => s.attr(),
        }
    }

    /// Fetch full headers for this node (enrichment). Best effort: a failed
    /// HEAD leaves the node with listing-level metadata only.
    pub(crate) async fn refresh_headers(&self, store: &Arc<dyn ObjectStore>) {
        let (container, name) = match self {
            Node::Directory(d) => (d.container().to_string(), d.store_name()),
            Node::Object(o) => (o.container().to_string(), o.path()),
            Node::Symlink(s) => (s.container().to_string(), s.path()),
        };
        match store.object(&container, &name).await {
            Ok((entry, headers)) => match self {
                Node::Directory(d) => d.absorb_head(entry, headers),
                Node::Object(o) => o.absorb_head(entry, headers),
                Node::Symlink(s) => s.absorb_head(entry, headers),
            },
            Err(err) => warn!("header fetch for {container}/{name} failed: {err}"),
        }
    }
}

/// Delete every segment referenced by a manifest pointer.
///
/// The pointer must have the `<container>/<prefix>` shape; segments are
/// enumerated by prefix and deleted one by one. Any delete failure aborts the
/// sweep; partial cleanup is reported, not rolled back.
pub(crate) async fn delete_segments(store: &Arc<dyn ObjectStore>, manifest: &str) -> Result<()> {
    let (container, prefix) = naming::split_manifest(manifest)
        .ok_or_else(|| FsError::InvalidManifest(manifest.to_string()))?;
    let entries = store
        .objects_all(
            container,
            &ListOptions {
                prefix: prefix.to_string(),
                delimiter: None,
            },
        )
        .await?;
    for entry in entries {
        store.object_delete(container, &entry.name).await?;
    }
    Ok(())
}
