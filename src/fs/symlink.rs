//! Symlink nodes: zero-byte link-typed objects whose target lives in a
//! metadata header.

use std::sync::{Arc, RwLock, Weak};

use super::directory::Directory;
use super::{Attr, EntryKind, FsCore};
use crate::store::{Entry, Headers, SYMLINK_HEADER};

struct Meta {
    entry: Entry,
    headers: Headers,
}

pub struct Symlink {
    core: Arc<FsCore>,
    container: String,
    parent: Weak<Directory>,
    name: String,
    path: String,
    meta: RwLock<Meta>,
}

impl Symlink {
    pub fn new(
        core: Arc<FsCore>,
        name: &str,
        path: &str,
        entry: Entry,
        headers: Headers,
        parent: Weak<Directory>,
    ) -> Self {
        let container = core.container.clone();
        Symlink {
            core,
            container,
            parent,
            name: name.to_string(),
            path: path.to_string(),
            meta: RwLock::new(Meta { entry, headers }),
        }
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    pub fn path(&self) -> String {
        self.path.clone()
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn parent(&self) -> Option<Arc<Directory>> {
        self.parent.upgrade()
    }

    /// The link target, once enrichment has fetched the header.
    pub fn target(&self) -> Option<String> {
        self.meta.read().unwrap().headers.get(SYMLINK_HEADER).cloned()
    }

    /// Readlink: an unenriched or damaged link resolves to the empty string
    /// rather than an error.
    pub fn readlink(&self) -> String {
        self.target().unwrap_or_default()
    }

    pub(crate) fn absorb_head(&self, entry: Entry, headers: Headers) {
        let mut meta = self.meta.write().unwrap();
        meta.entry = entry;
        for (k, v) in headers {
            meta.headers.insert(k, v);
        }
    }

    pub fn attr(&self) -> Attr {
        let cfg = &self.core.config;
        let meta = self.meta.read().unwrap();
        let mtime = super::naming::mtime_of(&meta.entry, &meta.headers);
        Attr {
            kind: EntryKind::Symlink,
            mode: cfg.default_mode,
            uid: cfg.default_uid,
            gid: cfg.default_gid,
            size: meta.entry.bytes,
            blocks: 0,
            block_size: cfg.block_size,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }
}
