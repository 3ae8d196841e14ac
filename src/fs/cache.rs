//! Directory cache and write-in-progress change cache.
//!
//! Both caches are advisory: mutations that touch the backend update them
//! synchronously on the success path and leave them alone on failure.
//! Invalidation is explicit; there is no TTL. A single lock guards each
//! whole map to keep lock ordering trivial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::Node;
use super::object::Object;

type Key = (String, String);

struct CacheEntry {
    parent: Option<Node>,
    children: HashMap<String, Node>,
}

/// `(container, parent path) → (parent node, name → child node)`.
///
/// Holds the owning reference to every live node; a node dies when its name
/// is deleted from its parent's entry or the entry is evicted wholesale.
#[derive(Default)]
pub struct DirectoryCache {
    entries: Mutex<HashMap<Key, CacheEntry>>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-loading existence check for a directory's entry.
    pub fn peek(&self, container: &str, path: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.contains_key(&(container.to_string(), path.to_string()))
    }

    /// Full entry: the parent node (if known) and every cached child.
    pub fn get_all(&self, container: &str, path: &str) -> Option<(Option<Node>, Vec<Node>)> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&(container.to_string(), path.to_string()))
            .map(|e| (e.parent.clone(), e.children.values().cloned().collect()))
    }

    /// Install or replace a directory's entry.
    pub fn add_all(
        &self,
        container: &str,
        path: &str,
        parent: Node,
        children: HashMap<String, Node>,
    ) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            (container.to_string(), path.to_string()),
            CacheEntry {
                parent: Some(parent),
                children,
            },
        );
    }

    pub fn get(&self, container: &str, path: &str, name: &str) -> Option<Node> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&(container.to_string(), path.to_string()))
            .and_then(|e| e.children.get(name).cloned())
    }

    /// Insert one child, creating the entry if absent. A parent node
    /// installed earlier by `add_all` is kept.
    pub fn set(&self, container: &str, path: &str, name: &str, child: Node) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry((container.to_string(), path.to_string()))
            .or_insert_with(|| CacheEntry {
                parent: None,
                children: HashMap::new(),
            });
        entry.children.insert(name.to_string(), child);
    }

    pub fn delete(&self, container: &str, path: &str, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&(container.to_string(), path.to_string())) {
            entry.children.remove(name);
        }
    }

    /// Evict a directory's whole entry (rmdir, rename).
    pub fn delete_all(&self, container: &str, path: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&(container.to_string(), path.to_string()));
    }
}

/// Objects with an open write handle, keyed by `(container, path)`.
///
/// Readdir consults this so a listing refresh never replaces a node that is
/// mid-write with an inert snapshot.
#[derive(Default)]
pub struct ChangeCache {
    entries: Mutex<HashMap<Key, Arc<Object>>>,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: &str, path: &str, object: Arc<Object>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert((container.to_string(), path.to_string()), object);
    }

    pub fn exists(&self, container: &str, path: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.contains_key(&(container.to_string(), path.to_string()))
    }

    pub fn get(&self, container: &str, path: &str) -> Option<Arc<Object>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    pub fn remove(&self, container: &str, path: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&(container.to_string(), path.to_string()));
    }
}
