//! Object nodes: regular files backed by one store object, or by a manifest
//! plus segments once a write outgrew the segment threshold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::SystemTime;

use bitflags::bitflags;
use tokio::sync::Mutex as AsyncMutex;

use super::directory::Directory;
use super::error::{FsError, Result};
use super::handle::ObjectHandle;
use super::naming;
use super::{Attr, EntryKind, FsCore};
use crate::store::{
    Entry, Headers, MANIFEST_HEADER, MTIME_HEADER, NONCE_HEADER, ORIGIN_SIZE_HEADER,
};

bitflags! {
    /// Flags returned to the kernel with an open reply, per the FUSE open
    /// response ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenOptions: u32 {
        /// Bypass the page cache for this file.
        const DIRECT_IO = 1;
        /// The file is not seekable.
        const NONSEEKABLE = 4;
    }
}

/// Accepted attribute changes; everything else is rejected upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetattrRequest {
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
}

struct Ident {
    name: String,
    path: String,
}

struct Meta {
    entry: Entry,
    headers: Headers,
}

pub struct Object {
    core: Arc<FsCore>,
    /// Self-handle for the change cache and open handles.
    me: Weak<Object>,
    container: String,
    segments_container: String,
    parent: Weak<Directory>,
    ident: RwLock<Ident>,
    meta: RwLock<Meta>,
    segmented: AtomicBool,
    writing: AtomicBool,
    /// Serializes writers; the owned guard lives in the write handle from
    /// open to release.
    pub(crate) lock: Arc<AsyncMutex<()>>,
}

impl Object {
    pub fn from_entry(
        core: Arc<FsCore>,
        name: &str,
        path: &str,
        entry: Entry,
        headers: Headers,
        parent: Weak<Directory>,
    ) -> Arc<Self> {
        let segmented = headers.contains_key(MANIFEST_HEADER);
        let container = core.container.clone();
        let segments_container = core.segments_container.clone();
        Arc::new_cyclic(|me| Object {
            core,
            me: me.clone(),
            container,
            segments_container,
            parent,
            ident: RwLock::new(Ident {
                name: name.to_string(),
                path: path.to_string(),
            }),
            meta: RwLock::new(Meta { entry, headers }),
            segmented: AtomicBool::new(segmented),
            writing: AtomicBool::new(false),
            lock: Arc::new(AsyncMutex::new(())),
        })
    }

    fn arc(&self) -> Arc<Object> {
        self.me.upgrade().expect("object node still referenced")
    }

    pub fn name(&self) -> String {
        self.ident.read().unwrap().name.clone()
    }

    pub fn path(&self) -> String {
        self.ident.read().unwrap().path.clone()
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn segments_container(&self) -> &str {
        &self.segments_container
    }

    pub fn parent(&self) -> Option<Arc<Directory>> {
        self.parent.upgrade()
    }

    pub fn segmented(&self) -> bool {
        self.segmented.load(Ordering::SeqCst)
    }

    pub fn writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_writing(&self, writing: bool) {
        self.writing.store(writing, Ordering::SeqCst);
    }

    pub fn bytes(&self) -> u64 {
        self.meta.read().unwrap().entry.bytes
    }

    pub(crate) fn set_bytes(&self, bytes: u64) {
        self.meta.write().unwrap().entry.bytes = bytes;
    }

    pub(crate) fn grow(&self, delta: u64) {
        self.meta.write().unwrap().entry.bytes += delta;
    }

    pub fn manifest(&self) -> Option<String> {
        self.meta.read().unwrap().headers.get(MANIFEST_HEADER).cloned()
    }

    /// Record a freshly created manifest pointer.
    pub(crate) fn set_manifest(&self, manifest: &str) {
        self.meta
            .write()
            .unwrap()
            .headers
            .insert(MANIFEST_HEADER.to_string(), manifest.to_string());
        self.segmented.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_ident(&self, name: &str, path: &str) {
        let mut ident = self.ident.write().unwrap();
        ident.name = name.to_string();
        ident.path = path.to_string();
    }

    /// Merge a HEAD result into the node, fetched headers winning.
    pub(crate) fn absorb_head(&self, entry: Entry, headers: Headers) {
        let mut meta = self.meta.write().unwrap();
        meta.entry = entry;
        for (k, v) in headers {
            meta.headers.insert(k, v);
        }
        self.segmented
            .store(meta.headers.contains_key(MANIFEST_HEADER), Ordering::SeqCst);
    }

    /// Stamp crypto writeback headers and return the full meta set to send.
    pub(crate) fn stamp_crypto_headers(&self, nonce: &str) -> Headers {
        let mut meta = self.meta.write().unwrap();
        meta.headers
            .insert(NONCE_HEADER.to_string(), nonce.to_string());
        let origin = meta.entry.bytes.to_string();
        meta.headers.insert(ORIGIN_SIZE_HEADER.to_string(), origin);
        naming::meta_headers(&meta.headers)
    }

    /// Reported size: the pre-encryption origin size when encryption is on
    /// and the header is present, otherwise the store size.
    fn size(&self) -> u64 {
        let meta = self.meta.read().unwrap();
        if self.core.config.encryption {
            if let Some(raw) = meta.headers.get(ORIGIN_SIZE_HEADER) {
                if let Ok(size) = raw.parse::<u64>() {
                    return size;
                }
            }
        }
        meta.entry.bytes
    }

    fn mtime(&self) -> SystemTime {
        let meta = self.meta.read().unwrap();
        if self.core.config.extra_attr {
            naming::mtime_of(&meta.entry, &meta.headers)
        } else {
            meta.entry.last_modified
        }
    }

    pub fn attr(&self) -> Attr {
        let cfg = &self.core.config;
        let size = self.size();
        let mtime = self.mtime();
        Attr {
            kind: EntryKind::File,
            mode: cfg.default_mode,
            uid: cfg.default_uid,
            gid: cfg.default_gid,
            size,
            blocks: (size / cfg.block_size as u64) * 8,
            block_size: cfg.block_size,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }

    /// Open this object. Append and read-write modes are unsupported; a
    /// write open takes the object lock for the lifetime of the handle,
    /// registers it in the change cache, and asks the kernel for direct,
    /// non-seekable I/O.
    pub async fn open(&self, flags: u32) -> Result<(ObjectHandle, OpenOptions)> {
        let create = flags & libc::O_CREAT as u32 != 0;
        if flags & libc::O_APPEND as u32 != 0 {
            return Err(FsError::NotSupported);
        }
        match flags as i32 & libc::O_ACCMODE {
            libc::O_RDONLY => {
                let handle = ObjectHandle::new(self.core.clone(), self.arc(), create, None);
                Ok((handle, OpenOptions::empty()))
            }
            libc::O_WRONLY => {
                let guard = self.lock.clone().lock_owned().await;
                let path = self.path();
                self.core.changes.add(&self.container, &path, self.arc());

                if self.segmented() && create {
                    if let Err(err) = self.remove_segments().await {
                        self.core.changes.remove(&self.container, &path);
                        drop(guard);
                        return Err(err);
                    }
                }

                let mut handle =
                    ObjectHandle::new(self.core.clone(), self.arc(), create, Some(guard));
                if create {
                    if let Err(err) = handle.open_writer().await {
                        self.core.changes.remove(&self.container, &path);
                        return Err(err);
                    }
                }
                Ok((handle, OpenOptions::DIRECT_IO | OpenOptions::NONSEEKABLE))
            }
            _ => Err(FsError::NotSupported),
        }
    }

    /// Size and mtime changes. Truncation to zero tears segments down;
    /// other sizes are recorded and settled by the next write. Mtime is
    /// persisted only with `extra_attr` on, serialized against an in-flight
    /// write.
    pub async fn setattr(&self, req: SetattrRequest) -> Result<()> {
        if let Some(size) = req.size {
            self.set_bytes(size);
            if size == 0 && self.segmented() {
                return self.remove_segments().await;
            }
            return Ok(());
        }

        let Some(mtime) = req.mtime else {
            return Err(FsError::NotSupported);
        };
        if !self.core.config.extra_attr {
            return Err(FsError::NotSupported);
        }
        if mtime == self.mtime() {
            return Ok(());
        }

        let _guard = if self.writing() {
            Some(self.lock.clone().lock_owned().await)
        } else {
            None
        };
        let headers = {
            let mut meta = self.meta.write().unwrap();
            meta.headers
                .insert(MTIME_HEADER.to_string(), naming::time_to_float_string(mtime));
            naming::meta_headers(&meta.headers)
        };
        self.core
            .store
            .object_update(&self.container, &self.path(), headers)
            .await?;
        Ok(())
    }

    /// Delete every referenced segment and drop the manifest pointer. On
    /// failure the pointer is kept so a retry can still find the segments.
    pub(crate) async fn remove_segments(&self) -> Result<()> {
        self.segmented.store(false, Ordering::SeqCst);
        let manifest = self.manifest();
        if let Some(manifest) = manifest {
            super::delete_segments(&self.core.store, &manifest).await?;
            self.meta.write().unwrap().headers.remove(MANIFEST_HEADER);
        }
        Ok(())
    }
}
