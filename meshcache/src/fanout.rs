//! The read fan-out dispatcher.
//!
//! A fixed pool of workers pulls `(peer, request)` pairs off a bounded queue
//! and issues a `GetReq` to each targeted peer. All peers queried for one
//! request race to complete a single shared reply slot; the first positive
//! answer wins and every later writer observes a harmless no-op.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::remote::RemoteNode;
use crate::CacheStore;

pub(crate) const GET_WORKER_COUNT: usize = 10;
pub(crate) const GET_QUEUE_CAPACITY: usize = 1024;

/// One peer lookup issued on behalf of a local cache miss.
pub(crate) struct GetTask<S: CacheStore> {
    pub node: Arc<RemoteNode<S>>,
    pub request: Arc<GetRequest>,
}

/// An in-flight cluster read.
///
/// The coordinator holds the matching [`oneshot::Receiver`] and races it
/// against the get timeout. Peers which have no answer never touch the slot,
/// and late replies after the first are silently absorbed rather than
/// erroring, so the timeout never has to cancel anything.
pub(crate) struct GetRequest {
    key: String,
    slot: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

impl GetRequest {
    pub(crate) fn new(key: impl Into<String>) -> (Arc<Self>, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            key: key.into(),
            slot: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Completes the request with a positive reply.
    ///
    /// Only the first caller wins; the rest find the slot already taken.
    pub(crate) fn complete(&self, data: Vec<u8>) {
        if let Some(tx) = self.slot.lock().take() {
            // The receiver may already have timed out and been dropped.
            let _ = tx.send(data);
        }
    }
}

/// A fan-out worker: forwards each queued lookup to its target peer.
///
/// Exits once the queue has been drained after shutdown dropped the sender.
pub(crate) async fn run_get_worker<S: CacheStore>(queue: flume::Receiver<GetTask<S>>) {
    while let Ok(task) = queue.recv_async().await {
        task.node.request_get(&task.request);
    }
    trace!("get fan-out worker stopped");
}
