//! Bounded concurrent enrichment of listing entries.
//!
//! Some direntries cannot be exposed from listing data alone: symlinks need
//! their target header, manifest candidates their manifest pointer, and with
//! `extra_attr` every entry wants its mtime override. The lister runs a fixed
//! pool of workers that HEAD the backing object and post the node back on the
//! submitter's reply channel.
//!
//! The reply is posted whether or not the HEAD succeeded: readdir drains
//! exactly as many replies as it enqueued, and a dropped reply would hang
//! that drain forever. Failures downgrade to listing-level metadata.

use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::Node;
use crate::store::ObjectStore;

struct Task {
    node: Node,
    reply: mpsc::Sender<Node>,
}

/// Fixed worker pool; at most `concurrency` HEAD requests are in flight.
/// Submissions past the queue bound block their caller.
#[derive(Clone)]
pub struct Lister {
    queue: mpsc::Sender<Task>,
}

impl Lister {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        let workers = concurrency.max(1);
        let (queue, rx) = mpsc::channel::<Task>(workers);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers {
            let rx = rx.clone();
            let store = store.clone();
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else { break };
                    task.node.refresh_headers(&store).await;
                    if task.reply.send(task.node).await.is_err() {
                        warn!("enrichment reply dropped: readdir went away");
                    }
                }
            });
        }
        Lister { queue }
    }

    /// Submit a node for enrichment; its enriched self comes back on
    /// `reply`.
    pub async fn add_task(&self, node: Node, reply: mpsc::Sender<Node>) {
        // The queue only closes when the Lister is dropped, which outlives
        // every readdir against its core.
        if self.queue.send(Task { node, reply }).await.is_err() {
            warn!("lister queue closed; entry left unenriched");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fs::object::Object;
    use crate::fs::FsCore;
    use crate::store::{
        Entry, Headers, ListOptions, MANIFEST_HEADER, ObjectReader, ObjectWriter, StoreError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Store double that counts concurrent HEADs and fails on demand.
    struct HeadProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl crate::store::ObjectStore for HeadProbe {
        async fn object_put_bytes(
            &self,
            _: &str,
            _: &str,
            _: &[u8],
            _: &str,
        ) -> Result<(), StoreError> {
            unreachable!()
        }

        async fn object_create(
            &self,
            _: &str,
            _: &str,
            _: bool,
            _: &str,
            _: &str,
            _: Headers,
        ) -> Result<Box<dyn ObjectWriter>, StoreError> {
            unreachable!()
        }

        async fn objects_all(
            &self,
            _: &str,
            _: &ListOptions,
        ) -> Result<Vec<Entry>, StoreError> {
            unreachable!()
        }

        async fn object(&self, container: &str, path: &str) -> Result<(Entry, Headers), StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::not_found(container, path));
            }
            let mut headers = Headers::new();
            headers.insert(MANIFEST_HEADER.to_string(), "segments/p".to_string());
            Ok((Entry::synthetic(path, ""), headers))
        }

        async fn object_open(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Box<dyn ObjectReader>, StoreError> {
            unreachable!()
        }

        async fn object_update(&self, _: &str, _: &str, _: Headers) -> Result<(), StoreError> {
            unreachable!()
        }

        async fn object_move(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
            unreachable!()
        }

        async fn manifest_copy(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: Option<Headers>,
        ) -> Result<(), StoreError> {
            unreachable!()
        }

        async fn object_delete(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unreachable!()
        }
    }

    fn probe_core(fail: bool, concurrency: usize) -> (Arc<FsCore>, Arc<HeadProbe>) {
        let probe = Arc::new(HeadProbe {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail,
        });
        let mut config = Config::default();
        config.lister_concurrency = concurrency;
        let core = FsCore::new(probe.clone(), config, "data", "segments");
        (core, probe)
    }

    fn object_node(core: &Arc<FsCore>, path: &str) -> Node {
        Node::Object(Object::from_entry(
            core.clone(),
            path,
            path,
            Entry::synthetic(path, ""),
            Headers::new(),
            std::sync::Weak::new(),
        ))
    }

    #[tokio::test]
    async fn head_fanout_is_bounded() {
        let (core, probe) = probe_core(false, 3);
        let (tx, mut rx) = mpsc::channel(3);
        let submitter = core.clone();
        tokio::spawn(async move {
            for i in 0..12 {
                let node = object_node(&submitter, &format!("o{i}"));
                submitter.lister.add_task(node, tx.clone()).await;
            }
        });
        let mut done = 0;
        while rx.recv().await.is_some() {
            done += 1;
        }
        assert_eq!(done, 12);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn enrichment_attaches_headers() {
        let (core, _) = probe_core(false, 2);
        let (tx, mut rx) = mpsc::channel(2);
        core.lister.add_task(object_node(&core, "big"), tx).await;
        let node = rx.recv().await.unwrap();
        match node {
            Node::Object(o) => assert!(o.segmented()),
            _ => panic!("expected object node"),
        }
    }

    #[tokio::test]
    async fn failed_head_still_replies() {
        let (core, _) = probe_core(true, 2);
        let (tx, mut rx) = mpsc::channel(2);
        core.lister.add_task(object_node(&core, "gone"), tx).await;
        let node = rx.recv().await.unwrap();
        match node {
            Node::Object(o) => assert!(!o.segmented()),
            _ => panic!("expected object node"),
        }
    }
}
