//! Directory nodes: real markers, synthesized pseudo-directories, and the
//! apex of a mount.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::UNIX_EPOCH;

use log::debug;
use tokio::sync::mpsc;

use super::error::{FsError, Result};
use super::handle::ObjectHandle;
use super::naming::{self, SEGMENT_PATH_RE};
use super::object::{Object, OpenOptions};
use super::symlink::Symlink;
use super::{Attr, DirEntry, EntryKind, FsCore, Node, delete_segments};
use crate::store::{
    DIR_CONTENT_TYPE, Entry, Headers, LINK_CONTENT_TYPE, ListOptions, MANIFEST_HEADER,
    SYMLINK_HEADER,
};

struct Meta {
    /// Backing marker, or `None` for the apex and for pseudo-directories
    /// inferred purely from children.
    entry: Option<Entry>,
    headers: Headers,
}

pub struct Directory {
    core: Arc<FsCore>,
    /// Self-handle for parent back-links and cache registration.
    me: Weak<Directory>,
    apex: bool,
    name: String,
    /// Ends with `/` except for the apex, whose path is empty.
    path: String,
    container: String,
    segments_container: String,
    meta: RwLock<Meta>,
}

impl Directory {
    /// The root of a mount.
    pub fn apex(core: Arc<FsCore>) -> Arc<Self> {
        let container = core.container.clone();
        let segments_container = core.segments_container.clone();
        Arc::new_cyclic(|me| Directory {
            core,
            me: me.clone(),
            apex: true,
            name: String::new(),
            path: String::new(),
            container,
            segments_container,
            meta: RwLock::new(Meta {
                entry: None,
                headers: Headers::new(),
            }),
        })
    }

    fn child(core: Arc<FsCore>, name: &str, path: String, entry: Option<Entry>) -> Arc<Self> {
        let container = core.container.clone();
        let segments_container = core.segments_container.clone();
        Arc::new_cyclic(|me| Directory {
            core,
            me: me.clone(),
            apex: false,
            name: name.to_string(),
            path,
            container,
            segments_container,
            meta: RwLock::new(Meta {
                entry,
                headers: Headers::new(),
            }),
        })
    }

    fn arc(&self) -> Arc<Directory> {
        self.me.upgrade().expect("directory node still referenced")
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

    pub fn segments_container(&self) -> &str {
        &self.segments_container
    }

    pub fn is_apex(&self) -> bool {
        self.apex
    }

    /// Name of the backing store object, used for HEAD and marker deletion.
    pub(crate) fn store_name(&self) -> String {
        let meta = self.meta.read().unwrap();
        match &meta.entry {
            Some(entry) => entry.name.clone(),
            None => self.path.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn absorb_head(&self, entry: Entry, headers: Headers) {
        let mut meta = self.meta.write().unwrap();
        meta.entry = Some(entry);
        for (k, v) in headers {
            meta.headers.insert(k, v);
        }
    }

    pub fn attr(&self) -> Attr {
        let cfg = &self.core.config;
        let meta = self.meta.read().unwrap();
        let mtime = match &meta.entry {
            Some(entry) if cfg.extra_attr => naming::mtime_of(entry, &meta.headers),
            Some(entry) => entry.last_modified,
            None => UNIX_EPOCH,
        };
        Attr {
            kind: EntryKind::Directory,
            mode: cfg.default_mode,
            uid: cfg.default_uid,
            gid: cfg.default_gid,
            size: cfg.block_size as u64,
            blocks: 0,
            block_size: cfg.block_size,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }

    /// Directory mode/owner/mtime are not persisted; accept and forget.
    pub fn setattr(&self) -> Result<()> {
        Ok(())
    }

    /// Create an empty object and open a handle on it.
    pub async fn create(
        &self,
        name: &str,
        flags: u32,
    ) -> Result<(Arc<Object>, ObjectHandle, OpenOptions)> {
        let path = format!("{}{}", self.path, name);
        let node = Object::from_entry(
            self.core.clone(),
            name,
            &path,
            Entry::synthetic(&path, ""),
            Headers::new(),
            self.me.clone(),
        );

        self.core
            .store
            .object_put_bytes(&self.container, &path, &[], "")
            .await?;

        let (handle, opts) = node.open(flags | libc::O_CREAT as u32).await?;

        self.core
            .cache
            .set(&self.container, &self.path, name, Node::Object(node.clone()));

        Ok((node, handle, opts))
    }

    /// A directory is an empty marker object with the directory content
    /// type; the node's path gains the trailing slash.
    pub async fn mkdir(&self, name: &str) -> Result<Arc<Directory>> {
        let marker = format!("{}{}", self.path, name);

        self.core
            .store
            .object_put_bytes(&self.container, &marker, &[], DIR_CONTENT_TYPE)
            .await
            .map_err(FsError::Store)?;

        let node = Directory::child(
            self.core.clone(),
            name,
            format!("{marker}/"),
            Some(Entry::synthetic(&marker, DIR_CONTENT_TYPE)),
        );

        self.core
            .cache
            .set(&self.container, &self.path, name, Node::Directory(node.clone()));

        Ok(node)
    }

    /// A symlink is a zero-byte link-typed object carrying its target in a
    /// metadata header.
    pub async fn symlink(&self, name: &str, target: &str) -> Result<Arc<Symlink>> {
        let path = format!("{}{}", self.path, name);
        let mut headers = Headers::new();
        headers.insert(SYMLINK_HEADER.to_string(), target.to_string());

        let writer = self
            .core
            .store
            .object_create(
                &self.container,
                &path,
                false,
                "",
                LINK_CONTENT_TYPE,
                headers.clone(),
            )
            .await?;
        writer.close().await?;

        let link = Arc::new(Symlink::new(
            self.core.clone(),
            name,
            &path,
            Entry::synthetic(&path, LINK_CONTENT_TYPE),
            headers,
            self.me.clone(),
        ));

        self.core
            .cache
            .set(&self.container, &self.path, name, Node::Symlink(link.clone()));

        Ok(link)
    }

    /// Find one child, listing the directory first if its cache entry is
    /// missing.
    pub async fn lookup(&self, name: &str) -> Result<Node> {
        if !self.core.cache.peek(&self.container, &self.path) {
            self.read_dir_all().await?;
        }
        self.core
            .cache
            .get(&self.container, &self.path, name)
            .ok_or(FsError::NotFound)
    }

    /// Synthesize this directory's children from a delimiter listing.
    ///
    /// Entries that need extra metadata (symlinks, manifest candidates, and
    /// everything when `extra_attr` is on) go through the lister; the drain
    /// waits for exactly as many replies as were enqueued. Entry order is
    /// processing order plus completion order; callers get set semantics
    /// only.
    pub async fn read_dir_all(&self) -> Result<Vec<DirEntry>> {
        if let Some((_, nodes)) = self.core.cache.get_all(&self.container, &self.path) {
            return Ok(nodes.iter().map(Node::export).collect());
        }

        let objects = self
            .core
            .store
            .objects_all(&self.container, &ListOptions::prefixed(&self.path, '/'))
            .await?;

        let (reply_tx, mut reply_rx) =
            mpsc::channel::<Node>(self.core.config.lister_concurrency.max(1));
        let mut real_dirs: HashSet<String> = HashSet::new();
        let mut enrich: Vec<Node> = Vec::new();
        let mut direntries = Vec::new();
        let mut children: HashMap<String, Node> = HashMap::new();

        for entry in objects {
            let path = entry.name.clone();
            let file_name = entry
                .name
                .strip_prefix(&self.path)
                .unwrap_or(&entry.name)
                .trim_end_matches('/')
                .to_string();
            if file_name.is_empty() {
                continue;
            }

            let mut child: Option<Node> = None;
            // Set when a live mid-write node was substituted; its metadata
            // must not be refreshed behind the writer's back.
            let mut in_flight = false;

            if naming::is_symlink(&entry, &self.path) {
                let link = Arc::new(Symlink::new(
                    self.core.clone(),
                    &file_name,
                    &path,
                    entry,
                    Headers::new(),
                    self.me.clone(),
                ));
                enrich.push(Node::Symlink(link));
            } else if naming::is_directory(&entry, &self.path) {
                let mut dir_path = path.clone();
                if !dir_path.ends_with('/') {
                    dir_path.push('/');
                }
                child = Some(Node::Directory(Directory::child(
                    self.core.clone(),
                    &file_name,
                    dir_path,
                    Some(entry),
                )));
                real_dirs.insert(file_name.clone());
            } else if naming::is_pseudo_directory(&entry, &self.path) {
                // Only when no real marker of the same short name was seen.
                // No backing object: the directory exists purely because
                // children share its prefix.
                if !real_dirs.contains(&file_name) {
                    child = Some(Node::Directory(Directory::child(
                        self.core.clone(),
                        &file_name,
                        path.clone(),
                        None,
                    )));
                    real_dirs.insert(file_name.clone());
                }
            } else if !entry.name.ends_with('/') {
                let is_large = naming::is_large_object(&entry);
                let node = Object::from_entry(
                    self.core.clone(),
                    &file_name,
                    &path,
                    entry,
                    Headers::new(),
                    self.me.clone(),
                );
                if let Some(live) = self.core.changes.get(&self.container, &path) {
                    // Being written right now: keep the live node.
                    child = Some(Node::Object(live));
                    in_flight = true;
                } else if is_large {
                    enrich.push(Node::Object(node));
                } else {
                    child = Some(Node::Object(node));
                }
            }

            if !in_flight && self.core.config.extra_attr {
                if let Some(node) = child.take() {
                    enrich.push(node);
                }
            }

            if let Some(node) = child {
                direntries.push(node.export());
                children.insert(node.name(), node);
            }
        }

        // Fan out from a separate task so the bounded lister queue can never
        // wedge against this drain loop.
        let pending = enrich.len();
        if pending > 0 {
            let lister = self.core.lister.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                for node in enrich {
                    lister.add_task(node, reply_tx.clone()).await;
                }
            });
        }
        drop(reply_tx);

        let mut done = 0usize;
        while done < pending {
            let Some(node) = reply_rx.recv().await else { break };
            done += 1;
            direntries.push(node.export());
            children.insert(node.name(), node);
        }

        self.core.cache.add_all(
            &self.container,
            &self.path,
            Node::Directory(self.arc()),
            children,
        );

        Ok(direntries)
    }

    /// Remove one child: best-effort marker delete for directories, full
    /// segment sweep for manifests, plain delete otherwise. Unknown node
    /// kinds (including symlinks) are refused.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = format!("{}{}", self.path, name);
        match self.core.cache.get(&self.container, &self.path, name) {
            Some(Node::Directory(dir)) => self.remove_directory(&dir, name).await,
            Some(Node::Object(object)) => self.remove_object(&object, name, &path).await,
            _ => Err(FsError::NotSupported),
        }
    }

    async fn remove_directory(&self, dir: &Arc<Directory>, name: &str) -> Result<()> {
        // The marker delete is best effort: pseudo-directories have no
        // marker at all, and the cache eviction below is what makes the
        // directory disappear.
        let marker = dir.store_name();
        if let Err(err) = self.core.store.object_delete(dir.container(), &marker).await {
            debug!("marker delete for {}/{marker} skipped: {err}", dir.container());
        }

        if self.core.cache.peek(dir.container(), &dir.path) {
            self.core.cache.delete_all(dir.container(), &dir.path);
        }
        self.core.cache.delete(dir.container(), &self.path, name);
        Ok(())
    }

    async fn remove_object(&self, object: &Arc<Object>, name: &str, path: &str) -> Result<()> {
        if object.segmented() {
            let (_, headers) = self.core.store.object(&self.container, path).await?;
            let manifest = headers.get(MANIFEST_HEADER).cloned().unwrap_or_default();
            if !SEGMENT_PATH_RE.is_match(&manifest) {
                return Err(FsError::InvalidManifest(name.to_string()));
            }
            delete_segments(&self.core.store, &manifest).await?;
        }

        self.core.store.object_delete(&self.container, path).await?;
        self.core.cache.delete(&self.container, &self.path, name);
        Ok(())
    }

    /// Move a child into `new_dir` under `new_name`. Only objects move:
    /// plain ones server-side, manifests by copy-then-delete so segments
    /// stay in place.
    pub async fn rename(&self, old_name: &str, new_dir: &Node, new_name: &str) -> Result<()> {
        let Node::Directory(target) = new_dir else {
            return Err(FsError::NotSupported);
        };
        let Some(Node::Object(object)) =
            self.core.cache.get(&self.container, &self.path, old_name)
        else {
            return Err(FsError::NotSupported);
        };
        if object.segmented() {
            self.move_manifest(&object, old_name, target, new_name).await
        } else {
            self.move_object(&object, old_name, target, new_name).await
        }
    }

    async fn move_object(
        &self,
        object: &Arc<Object>,
        old_name: &str,
        new_dir: &Arc<Directory>,
        new_name: &str,
    ) -> Result<()> {
        let src = format!("{}{}", self.path, old_name);
        let dst = format!("{}{}", new_dir.path, new_name);

        self.core
            .store
            .object_move(&self.container, &src, new_dir.container(), &dst)
            .await?;

        object.set_ident(new_name, &dst);
        self.core.cache.delete(&self.container, &self.path, old_name);
        self.core.cache.set(
            new_dir.container(),
            &new_dir.path,
            new_name,
            Node::Object(object.clone()),
        );
        Ok(())
    }

    async fn move_manifest(
        &self,
        object: &Arc<Object>,
        old_name: &str,
        new_dir: &Arc<Directory>,
        new_name: &str,
    ) -> Result<()> {
        let src = format!("{}{}", self.path, old_name);
        let dst = format!("{}{}", new_dir.path, new_name);

        self.core
            .store
            .manifest_copy(&self.container, &src, new_dir.container(), &dst, None)
            .await?;
        // A failure here strands the source manifest; surfaced, not retried.
        self.core.store.object_delete(&self.container, &src).await?;

        object.set_ident(new_name, &dst);
        self.core.cache.delete(&self.container, &self.path, old_name);
        self.core.cache.set(
            new_dir.container(),
            &new_dir.path,
            new_name,
            Node::Object(object.clone()),
        );
        Ok(())
    }
}
