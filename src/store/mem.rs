//! In-memory object store: the mock backend for tests and the demo mount.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use super::{
    Entry, Headers, ListOptions, MANIFEST_HEADER, ObjectReader, ObjectStore, ObjectWriter,
    StoreError,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
    headers: Headers,
    last_modified: SystemTime,
}

#[derive(Default)]
struct Inner {
    containers: Mutex<HashMap<String, BTreeMap<String, StoredObject>>>,
    list_calls: AtomicUsize,
    delete_faults: Mutex<HashSet<(String, String)>>,
}

/// A complete [`ObjectStore`] over process memory. Keyspaces are sorted, so
/// listings come back in lexicographic order the way real backends return
/// them, and manifest reads concatenate segments in that same order.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Inner>,
}

impl MemStore {
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(containers: I) -> Self {
        let mut map = HashMap::new();
        for name in containers {
            map.insert(name.to_string(), BTreeMap::new());
        }
        MemStore {
            inner: Arc::new(Inner {
                containers: Mutex::new(map),
                list_calls: AtomicUsize::new(0),
                delete_faults: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Number of listing calls served; lets tests assert cache hits.
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::Relaxed)
    }

    /// Make deletes of one object fail with a backend error; lets tests
    /// drive transport failures through the trait surface.
    pub fn inject_delete_error(&self, container: &str, path: &str) {
        self.inner
            .delete_faults
            .lock()
            .unwrap()
            .insert((container.to_string(), path.to_string()));
    }

    /// Insert an object directly, bypassing the trait surface.
    pub fn seed_object(
        &self,
        container: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
        headers: Headers,
    ) {
        let mut containers = self.inner.containers.lock().unwrap();
        let space = containers.entry(container.to_string()).or_default();
        space.insert(
            path.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
                headers,
                last_modified: SystemTime::now(),
            },
        );
    }

    /// All object names in a container, sorted.
    pub fn object_paths(&self, container: &str) -> Vec<String> {
        let containers = self.inner.containers.lock().unwrap();
        containers
            .get(container)
            .map(|space| space.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw body of one object, if present.
    pub fn object_bytes(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        let containers = self.inner.containers.lock().unwrap();
        containers
            .get(container)
            .and_then(|space| space.get(path))
            .map(|o| o.data.clone())
    }

    /// Stored headers of one object, if present.
    pub fn object_headers(&self, container: &str, path: &str) -> Option<Headers> {
        let containers = self.inner.containers.lock().unwrap();
        containers
            .get(container)
            .and_then(|space| space.get(path))
            .map(|o| o.headers.clone())
    }

    fn with_object<T>(
        &self,
        container: &str,
        path: &str,
        f: impl FnOnce(&StoredObject) -> T,
    ) -> Result<T, StoreError> {
        let containers = self.inner.containers.lock().unwrap();
        let space = containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        let obj = space
            .get(path)
            .ok_or_else(|| StoreError::not_found(container, path))?;
        Ok(f(obj))
    }

    /// Resolve a manifest header value into the bodies of its segments, in
    /// lexicographic name order.
    fn expand_manifest(&self, manifest: &str) -> Result<Vec<u8>, StoreError> {
        let (container, prefix) = manifest
            .split_once('/')
            .ok_or_else(|| StoreError::Backend(format!("malformed manifest: {manifest}")))?;
        let containers = self.inner.containers.lock().unwrap();
        let space = containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        let mut body = Vec::new();
        for (_, obj) in space.range(prefix.to_string()..).take_while(|(name, _)| {
            name.starts_with(prefix)
        }) {
            body.extend_from_slice(&obj.data);
        }
        Ok(body)
    }

    fn manifest_of(obj: &StoredObject) -> Option<String> {
        obj.headers.get(MANIFEST_HEADER).cloned()
    }

    fn entry_of(name: &str, obj: &StoredObject) -> Entry {
        Entry {
            name: name.to_string(),
            bytes: obj.data.len() as u64,
            content_type: obj.content_type.clone(),
            last_modified: obj.last_modified,
            pseudo_directory: false,
        }
    }
}

struct MemWriter {
    inner: Arc<Inner>,
    container: String,
    path: String,
    content_type: String,
    headers: Headers,
    buf: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for MemWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), StoreError> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        let mut containers = self.inner.containers.lock().unwrap();
        let space = containers
            .get_mut(&self.container)
            .ok_or_else(|| StoreError::ContainerNotFound(self.container.clone()))?;
        space.insert(
            self.path.clone(),
            StoredObject {
                data: self.buf,
                content_type: self.content_type,
                headers: self.headers,
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn object_put_bytes(
        &self,
        container: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        let mut containers = self.inner.containers.lock().unwrap();
        let space = containers
            .get_mut(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        space.insert(
            path.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
                headers: Headers::new(),
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn object_create(
        &self,
        container: &str,
        path: &str,
        _check_hash: bool,
        _hash: &str,
        content_type: &str,
        headers: Headers,
    ) -> Result<Box<dyn ObjectWriter>, StoreError> {
        {
            let containers = self.inner.containers.lock().unwrap();
            if !containers.contains_key(container) {
                return Err(StoreError::ContainerNotFound(container.to_string()));
            }
        }
        Ok(Box::new(MemWriter {
            inner: self.inner.clone(),
            container: container.to_string(),
            path: path.to_string(),
            content_type: content_type.to_string(),
            headers,
            buf: Vec::new(),
        }))
    }

    async fn objects_all(
        &self,
        container: &str,
        opts: &ListOptions,
    ) -> Result<Vec<Entry>, StoreError> {
        self.inner.list_calls.fetch_add(1, Ordering::Relaxed);
        let containers = self.inner.containers.lock().unwrap();
        let space = containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        let mut out = Vec::new();
        let mut collapsed: HashSet<String> = HashSet::new();
        for (name, obj) in space.iter() {
            if !name.starts_with(&opts.prefix) {
                continue;
            }
            let rest = &name[opts.prefix.len()..];
            if rest.is_empty() {
                continue;
            }
            if let Some(delim) = opts.delimiter {
                if let Some(idx) = rest.find(delim) {
                    // Collapse everything below the first delimiter into one
                    // pseudo-directory entry.
                    let pseudo = format!("{}{}", opts.prefix, &rest[..=idx]);
                    if collapsed.insert(pseudo.clone()) {
                        out.push(Entry {
                            name: pseudo,
                            bytes: 0,
                            content_type: String::new(),
                            last_modified: SystemTime::UNIX_EPOCH,
                            pseudo_directory: true,
                        });
                    }
                    continue;
                }
            }
            out.push(Self::entry_of(name, obj));
        }
        Ok(out)
    }

    async fn object(&self, container: &str, path: &str) -> Result<(Entry, Headers), StoreError> {
        let (mut entry, headers, manifest) = self.with_object(container, path, |obj| {
            (
                Self::entry_of(path, obj),
                obj.headers.clone(),
                Self::manifest_of(obj),
            )
        })?;
        if let Some(manifest) = manifest {
            entry.bytes = self.expand_manifest(&manifest)?.len() as u64;
        }
        Ok((entry, headers))
    }

    async fn object_open(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Box<dyn ObjectReader>, StoreError> {
        let (data, manifest) =
            self.with_object(container, path, |obj| (obj.data.clone(), Self::manifest_of(obj)))?;
        let body = match manifest {
            Some(manifest) => self.expand_manifest(&manifest)?,
            None => data,
        };
        Ok(Box::new(Cursor::new(body)))
    }

    async fn object_update(
        &self,
        container: &str,
        path: &str,
        headers: Headers,
    ) -> Result<(), StoreError> {
        let mut containers = self.inner.containers.lock().unwrap();
        let space = containers
            .get_mut(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        let obj = space
            .get_mut(path)
            .ok_or_else(|| StoreError::not_found(container, path))?;
        for (k, v) in headers {
            obj.headers.insert(k, v);
        }
        Ok(())
    }

    async fn object_move(
        &self,
        src_container: &str,
        src_path: &str,
        dst_container: &str,
        dst_path: &str,
    ) -> Result<(), StoreError> {
        let mut containers = self.inner.containers.lock().unwrap();
        let obj = containers
            .get_mut(src_container)
            .ok_or_else(|| StoreError::ContainerNotFound(src_container.to_string()))?
            .remove(src_path)
            .ok_or_else(|| StoreError::not_found(src_container, src_path))?;
        containers
            .get_mut(dst_container)
            .ok_or_else(|| StoreError::ContainerNotFound(dst_container.to_string()))?
            .insert(dst_path.to_string(), obj);
        Ok(())
    }

    async fn manifest_copy(
        &self,
        src_container: &str,
        src_path: &str,
        dst_container: &str,
        dst_path: &str,
        headers: Option<Headers>,
    ) -> Result<(), StoreError> {
        let mut containers = self.inner.containers.lock().unwrap();
        let mut obj = containers
            .get(src_container)
            .ok_or_else(|| StoreError::ContainerNotFound(src_container.to_string()))?
            .get(src_path)
            .cloned()
            .ok_or_else(|| StoreError::not_found(src_container, src_path))?;
        if let Some(extra) = headers {
            for (k, v) in extra {
                obj.headers.insert(k, v);
            }
        }
        containers
            .get_mut(dst_container)
            .ok_or_else(|| StoreError::ContainerNotFound(dst_container.to_string()))?
            .insert(dst_path.to_string(), obj);
        Ok(())
    }

    async fn object_delete(&self, container: &str, path: &str) -> Result<(), StoreError> {
        {
            let faults = self.inner.delete_faults.lock().unwrap();
            if faults.contains(&(container.to_string(), path.to_string())) {
                return Err(StoreError::Backend(format!(
                    "injected delete failure for {container}/{path}"
                )));
            }
        }
        let mut containers = self.inner.containers.lock().unwrap();
        let space = containers
            .get_mut(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        space
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(container, path))
    }
}
