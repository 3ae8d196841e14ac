//! rfuse3 glue: translates kernel requests into node operations.
//!
//! The node graph is path-identified; the kernel speaks inodes. This adapter
//! owns the `(container, path) ⇄ ino` table (the apex is inode 1) and the
//! `fh → ObjectHandle` table, and maps [`FsError`] onto errno replies.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::Error as IoError;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Inode, Result, SetAttr, Timestamp};
use tokio::sync::Mutex as AsyncMutex;

use crate::fs::object::SetattrRequest;
use crate::fs::{Attr, Directory, EntryKind, FsError, Node, ObjFs, ObjectHandle};

const ENTRY_TTL: Duration = Duration::from_secs(1);

struct InodeTable {
    next: u64,
    by_ino: HashMap<u64, Node>,
    ino_by_key: HashMap<(String, String), u64>,
}

/// One mounted volume as seen by the kernel.
pub struct ObjFuse {
    fs: ObjFs,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, Arc<AsyncMutex<Option<ObjectHandle>>>>>,
    next_fh: AtomicU64,
}

impl ObjFuse {
    pub fn new(fs: ObjFs) -> Self {
        let root = Node::Directory(fs.root());
        let mut by_ino = HashMap::new();
        let mut ino_by_key = HashMap::new();
        by_ino.insert(1, root.clone());
        ino_by_key.insert((root.container(), root.path()), 1);
        ObjFuse {
            fs,
            inodes: Mutex::new(InodeTable {
                next: 1,
                by_ino,
                ino_by_key,
            }),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn errno(err: FsError) -> Errno {
        IoError::from_raw_os_error(err.errno()).into()
    }

    fn raw(code: libc::c_int) -> Errno {
        IoError::from_raw_os_error(code).into()
    }

    fn node(&self, ino: Inode) -> Result<Node> {
        let table = self.inodes.lock().unwrap();
        table.by_ino.get(&ino).cloned().ok_or_else(|| Self::raw(libc::ENOENT))
    }

    fn directory(&self, ino: Inode) -> Result<Arc<Directory>> {
        match self.node(ino)? {
            Node::Directory(dir) => Ok(dir),
            _ => Err(Self::raw(libc::ENOTDIR)),
        }
    }

    /// Pin a node into the inode table, reusing the ino of its path
    /// identity so the kernel sees stable inodes across cache refreshes.
    fn bind(&self, node: &Node) -> u64 {
        let key = (node.container(), node.path());
        let mut table = self.inodes.lock().unwrap();
        if let Some(&ino) = table.ino_by_key.get(&key) {
            table.by_ino.insert(ino, node.clone());
            ino
        } else {
            table.next += 1;
            let ino = table.next;
            table.ino_by_key.insert(key, ino);
            table.by_ino.insert(ino, node.clone());
            ino
        }
    }

    /// Move an identity to a new key after rename.
    fn rebind(&self, old_key: (String, String), node: &Node) {
        let mut table = self.inodes.lock().unwrap();
        if let Some(ino) = table.ino_by_key.remove(&old_key) {
            table
                .ino_by_key
                .insert((node.container(), node.path()), ino);
            table.by_ino.insert(ino, node.clone());
        }
    }

    /// Forget the path bindings a removed entry may have had (object or
    /// directory form).
    fn unbind(&self, container: &str, parent_path: &str, name: &str) {
        let mut table = self.inodes.lock().unwrap();
        table
            .ino_by_key
            .remove(&(container.to_string(), format!("{parent_path}{name}")));
        table
            .ino_by_key
            .remove(&(container.to_string(), format!("{parent_path}{name}/")));
    }

    fn store_handle(&self, handle: ObjectHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap()
            .insert(fh, Arc::new(AsyncMutex::new(Some(handle))));
        fh
    }

    fn handle(&self, fh: u64) -> Result<Arc<AsyncMutex<Option<ObjectHandle>>>> {
        self.handles
            .lock()
            .unwrap()
            .get(&fh)
            .cloned()
            .ok_or_else(|| Self::raw(libc::EBADF))
    }

    fn name_str(name: &OsStr) -> Result<&str> {
        name.to_str().ok_or_else(|| Self::raw(libc::EINVAL))
    }

    fn file_attr(ino: u64, attr: &Attr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: Timestamp::from(attr.atime),
            mtime: Timestamp::from(attr.mtime),
            ctime: Timestamp::from(attr.ctime),
            kind: match attr.kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::File => FileType::RegularFile,
                EntryKind::Symlink => FileType::Symlink,
            },
            perm: (attr.mode & 0o7777) as u16,
            nlink: if attr.kind == EntryKind::Directory { 2 } else { 1 },
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: attr.block_size,
        }
    }

    fn entry_reply(ino: u64, attr: &Attr) -> ReplyEntry {
        ReplyEntry {
            ttl: ENTRY_TTL,
            attr: Self::file_attr(ino, attr),
            generation: 0,
        }
    }

    fn kind_of(kind: EntryKind) -> FileType {
        match kind {
            EntryKind::Directory => FileType::Directory,
            EntryKind::File => FileType::RegularFile,
            EntryKind::Symlink => FileType::Symlink,
        }
    }

    /// Children of a listed directory, resolved back through the cache so
    /// direntries carry real inodes.
    fn listed_children(&self, dir: &Arc<Directory>) -> Vec<(u64, FileType, String, Node)> {
        let core = self.fs.core();
        let mut out = Vec::new();
        if let Some((_, nodes)) = core.cache.get_all(dir.container(), &dir.path()) {
            for node in nodes {
                let ino = self.bind(&node);
                let export = node.export();
                out.push((ino, Self::kind_of(export.kind), export.name, node));
            }
        }
        out
    }
}

impl Filesystem for ObjFuse {
    async fn init(&self, _req: Request) -> Result<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(128 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: Inode, name: &OsStr) -> Result<ReplyEntry> {
        let dir = self.directory(parent)?;
        let name = Self::name_str(name)?;
        let node = dir.lookup(name).await.map_err(Self::errno)?;
        let ino = self.bind(&node);
        Ok(Self::entry_reply(ino, &node.attr()))
    }

    async fn forget(&self, _req: Request, _inode: Inode, _nlookup: u64) {}

    async fn getattr(
        &self,
        _req: Request,
        inode: Inode,
        _fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr> {
        let node = self.node(inode)?;
        Ok(ReplyAttr {
            ttl: ENTRY_TTL,
            attr: Self::file_attr(inode, &node.attr()),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: Inode,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr> {
        let node = self.node(inode)?;
        match &node {
            Node::Directory(dir) => dir.setattr().map_err(Self::errno)?,
            Node::Object(object) => {
                let req = SetattrRequest {
                    size: set_attr.size,
                    mtime: set_attr
                        .mtime
                        .map(|ts| SystemTime::UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec)),
                };
                object.setattr(req).await.map_err(Self::errno)?;
            }
            Node::Symlink(_) => return Err(Self::raw(libc::ENOTSUP)),
        }
        Ok(ReplyAttr {
            ttl: ENTRY_TTL,
            attr: Self::file_attr(inode, &node.attr()),
        })
    }

    async fn readlink(&self, _req: Request, inode: Inode) -> Result<ReplyData> {
        match self.node(inode)? {
            Node::Symlink(link) => Ok(ReplyData {
                data: Bytes::from(link.readlink().into_bytes()),
            }),
            _ => Err(Self::raw(libc::EINVAL)),
        }
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        link: &OsStr,
    ) -> Result<ReplyEntry> {
        let dir = self.directory(parent)?;
        let name = Self::name_str(name)?;
        let target = Self::name_str(link)?;
        let node = dir.symlink(name, target).await.map_err(Self::errno)?;
        let node = Node::Symlink(node);
        let ino = self.bind(&node);
        Ok(Self::entry_reply(ino, &node.attr()))
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry> {
        let dir = self.directory(parent)?;
        let name = Self::name_str(name)?;
        let node = dir.mkdir(name).await.map_err(Self::errno)?;
        let node = Node::Directory(node);
        let ino = self.bind(&node);
        Ok(Self::entry_reply(ino, &node.attr()))
    }

    async fn unlink(&self, _req: Request, parent: Inode, name: &OsStr) -> Result<()> {
        let dir = self.directory(parent)?;
        let name = Self::name_str(name)?;
        dir.remove(name).await.map_err(Self::errno)?;
        self.unbind(dir.container(), &dir.path(), name);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: Inode, name: &OsStr) -> Result<()> {
        let dir = self.directory(parent)?;
        let name = Self::name_str(name)?;
        dir.remove(name).await.map_err(Self::errno)?;
        self.unbind(dir.container(), &dir.path(), name);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> Result<()> {
        let dir = self.directory(parent)?;
        let name = Self::name_str(name)?;
        let new_name = Self::name_str(new_name)?;
        let target = self.node(new_parent)?;
        dir.rename(name, &target, new_name)
            .await
            .map_err(Self::errno)?;

        let old_key = (dir.container().to_string(), format!("{}{name}", dir.path()));
        let core = self.fs.core();
        if let Some(moved) = core
            .cache
            .get(&target.container(), &target.path(), new_name)
        {
            self.rebind(old_key, &moved);
        }
        Ok(())
    }

    async fn open(&self, _req: Request, inode: Inode, flags: u32) -> Result<ReplyOpen> {
        match self.node(inode)? {
            Node::Object(object) => {
                let (handle, opts) = object.open(flags).await.map_err(Self::errno)?;
                let fh = self.store_handle(handle);
                Ok(ReplyOpen {
                    fh,
                    flags: opts.bits(),
                })
            }
            _ => Err(Self::raw(libc::ENOTSUP)),
        }
    }

    async fn read(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData> {
        let slot = self.handle(fh)?;
        let mut slot = slot.lock().await;
        let handle = slot.as_mut().ok_or_else(|| Self::raw(libc::EBADF))?;
        let data = handle
            .read(offset, size as usize)
            .await
            .map_err(Self::errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        _offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite> {
        let slot = self.handle(fh)?;
        let mut slot = slot.lock().await;
        let handle = slot.as_mut().ok_or_else(|| Self::raw(libc::EBADF))?;
        let written = handle.write(data).await.map_err(Self::errno)?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, _inode: Inode) -> Result<ReplyStatFs> {
        let block_size = self.fs.core().config.block_size;
        Ok(ReplyStatFs {
            blocks: 1 << 30,
            bfree: 1 << 30,
            bavail: 1 << 30,
            files: 1 << 20,
            ffree: 1 << 20,
            bsize: block_size,
            namelen: 255,
            frsize: block_size,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: Inode,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<()> {
        let slot = {
            let mut handles = self.handles.lock().unwrap();
            handles.remove(&fh)
        };
        let Some(slot) = slot else {
            return Err(Self::raw(libc::EBADF));
        };
        let handle = slot.lock().await.take();
        if let Some(handle) = handle {
            handle.release().await.map_err(Self::errno)?;
        }
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: Inode, _fh: u64, _datasync: bool) -> Result<()> {
        Ok(())
    }

    async fn flush(&self, _req: Request, _inode: Inode, _fh: u64, _lock_owner: u64) -> Result<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, _inode: Inode, _mask: u32) -> Result<()> {
        Ok(())
    }

    async fn create(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated> {
        let dir = self.directory(parent)?;
        let name = Self::name_str(name)?;
        let (object, handle, opts) = dir.create(name, flags).await.map_err(Self::errno)?;
        let node = Node::Object(object);
        let ino = self.bind(&node);
        let fh = self.store_handle(handle);
        Ok(ReplyCreated {
            ttl: ENTRY_TTL,
            attr: Self::file_attr(ino, &node.attr()),
            generation: 0,
            fh,
            flags: opts.bits(),
        })
    }

    async fn opendir(&self, _req: Request, inode: Inode, _flags: u32) -> Result<ReplyOpen> {
        self.directory(inode)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir(
        &self,
        _req: Request,
        parent: Inode,
        _fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<impl Stream<Item = Result<DirectoryEntry>> + Send + '_>> {
        let dir = self.directory(parent)?;
        dir.read_dir_all().await.map_err(Self::errno)?;

        let mut entries: Vec<Result<DirectoryEntry>> = vec![
            Ok(DirectoryEntry {
                inode: parent,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
            }),
            Ok(DirectoryEntry {
                inode: parent,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            }),
        ];
        for (i, (ino, kind, name, _)) in self.listed_children(&dir).into_iter().enumerate() {
            entries.push(Ok(DirectoryEntry {
                inode: ino,
                kind,
                name: OsString::from(name),
                offset: i as i64 + 3,
            }));
        }

        let entries: Vec<_> = entries.into_iter().skip(offset as usize).collect();
        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn releasedir(&self, _req: Request, _inode: Inode, _fh: u64, _flags: u32) -> Result<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _inode: Inode, _fh: u64, _datasync: bool) -> Result<()> {
        Ok(())
    }

    async fn readdirplus(
        &self,
        _req: Request,
        parent: Inode,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<impl Stream<Item = Result<DirectoryEntryPlus>> + Send + '_>> {
        let dir = self.directory(parent)?;
        dir.read_dir_all().await.map_err(Self::errno)?;

        let mut entries: Vec<Result<DirectoryEntryPlus>> = vec![
            Ok(DirectoryEntryPlus {
                inode: parent,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
                attr: Self::file_attr(parent, &dir.attr()),
                entry_ttl: ENTRY_TTL,
                attr_ttl: ENTRY_TTL,
            }),
            Ok(DirectoryEntryPlus {
                inode: parent,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
                attr: Self::file_attr(parent, &dir.attr()),
                entry_ttl: ENTRY_TTL,
                attr_ttl: ENTRY_TTL,
            }),
        ];
        for (i, (ino, kind, name, node)) in self.listed_children(&dir).into_iter().enumerate() {
            entries.push(Ok(DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind,
                name: OsString::from(name),
                offset: i as i64 + 3,
                attr: Self::file_attr(ino, &node.attr()),
                entry_ttl: ENTRY_TTL,
                attr_ttl: ENTRY_TTL,
            }));
        }

        let entries: Vec<_> = entries.into_iter().skip(offset as usize).collect();
        Ok(ReplyDirectoryPlus {
            entries: stream::iter(entries),
        })
    }
}
