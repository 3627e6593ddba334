//! # meshcache
//! The clustering layer of a distributed in-memory cache: turns a set of
//! independent cache processes into a self-assembling mesh, replicates
//! writes to a configurable number of peers, and serves reads from the
//! cluster when a key is missing locally.
//!
//! Membership knowledge spreads by gossip flooding: every new link floods
//! both sides' known-peer lists, and a discovery consumer dials every peer
//! it has not seen before, converging the cluster toward a full mesh with
//! no central coordinator. Replication is best-effort and eventually
//! consistent - there is no leader election, quorum, or conflict
//! resolution.
//!
//! The local key-value engine is an external collaborator behind the
//! [`CacheStore`] trait.
//!
//! ## Basic Example
//!
//! ```rust,no_run
//! use meshcache::test_utils::MemStore;
//! use meshcache::{ClusterConfig, MeshCache};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClusterConfig {
//!         listen_port: 9911,
//!         ..Default::default()
//!     };
//!
//!     let node = MeshCache::new(config, MemStore::default());
//!     node.start().await?;
//!
//!     node.put("my-key", b"Hello, world!".to_vec(), None)?;
//!     let value = node.get("my-key").await?;
//!     assert_eq!(value, b"Hello, world!");
//!
//!     node.shutdown();
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod config;
mod discovery;
mod error;
mod fanout;
mod membership;
mod remote;
mod replication;
mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use config::ClusterConfig;
use dashmap::DashMap;
pub use error::ClusterError;
use parking_lot::{Mutex, RwLock};
pub use storage::{unix_millis_now, CacheStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::discovery::ProposedPeer;
use crate::fanout::{GetRequest, GetTask};
use crate::membership::Registry;
use crate::remote::{RemoteNode, RemoteNodeConfig};
use crate::wire::PeerAnnouncement;

/// An opaque, cluster-wide unique node identity.
pub type NodeId = String;

/// How many consecutive accept failures trip the listener circuit breaker.
const MAX_ACCEPT_FAILURES: u32 = 5;

/// A cluster node: the coordinator owning the membership registry, the
/// listener, the discovery queue and the public put/get/delete API.
pub struct MeshCache<S: CacheStore> {
    inner: Arc<ClusterInner<S>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CacheStore> MeshCache<S> {
    /// Creates a new, not yet started cluster node on top of a local store.
    ///
    /// Out-of-range configuration is corrected with a warning here; a node
    /// identity is synthesized when absent.
    pub fn new(mut config: ClusterConfig, store: S) -> Self {
        let node_id = config.normalize();

        Self {
            inner: ClusterInner::new(node_id, config, store),
            listener_task: Mutex::new(None),
        }
    }

    /// Brings the node up: binds the listener, launches the discovery
    /// consumer and the read fan-out pool, and joins the seed peer when
    /// configured to.
    ///
    /// Fails only for a zero listen port, a bind failure, or a missing seed
    /// address when `join` is set. A seed that cannot be reached is logged,
    /// not returned: the node stays up and waits for inbound peers.
    pub async fn start(&self) -> Result<(), ClusterError> {
        let inner = &self.inner;

        if inner.config.listen_port == 0 {
            error!("the listen port can not be zero");
            return Err(ClusterError::InvalidListenPort);
        }

        if inner.config.join && inner.config.seed_address.is_none() {
            error!("the seed address to join can not be empty since join is enabled");
            return Err(ClusterError::MissingSeedAddress);
        }

        let bind_addr = inner.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|error| {
            error!(addr = %bind_addr, error = %error, "unable to listen for peers");
            ClusterError::Io(error)
        })?;

        info!(node_id = %inner.node_id, addr = %bind_addr, "bringing up node");

        let (discovery_tx, discovery_rx) =
            flume::bounded(discovery::DISCOVERY_QUEUE_CAPACITY);
        let (fanout_tx, fanout_rx) = flume::bounded(fanout::GET_QUEUE_CAPACITY);
        *inner.discovery_tx.write() = Some(discovery_tx);
        *inner.fanout_tx.write() = Some(fanout_tx);

        for _ in 0..fanout::GET_WORKER_COUNT {
            tokio::spawn(fanout::run_get_worker(fanout_rx.clone()));
        }
        tokio::spawn(discovery::run_discovery(inner.clone(), discovery_rx));

        let handle = tokio::spawn(run_listener(inner.clone(), listener));
        *self.listener_task.lock() = Some(handle);

        if inner.config.join {
            // Checked above.
            let seed = inner.config.seed_address.clone().unwrap_or_default();
            let node = RemoteNode::new(
                inner.clone(),
                RemoteNodeConfig {
                    id: None,
                    addr: seed,
                    connect_retries: inner.config.connect_retries,
                },
            );
            node.join().await;
        }

        Ok(())
    }

    /// Shuts the node down: stops accepting connections and new work,
    /// releases the work queues once quiescent, and terminates every peer
    /// connection. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(node_id = %self.inner.node_id, "shutting down cluster node");

        if let Some(handle) = self.listener_task.lock().take() {
            handle.abort();
        }

        // Producers observe the emptied slots and stop enqueueing; the
        // consumers drain what is left and exit on disconnect. A racing
        // producer holding a clone gets a send error, never a panic.
        let discovery_tx = self.inner.discovery_tx.write().take();
        let fanout_tx = self.inner.fanout_tx.write().take();
        drop((discovery_tx, fanout_tx));

        for peer in self.inner.peer_snapshot() {
            peer.terminate();
        }
    }

    /// Writes a key locally and mirrors it to `replication_factor - 1`
    /// peers chosen by round-robin rotation.
    ///
    /// With a replication factor of 1 no peer traffic is ever generated.
    /// With fewer known peers than the replication factor the local write
    /// still happens but [`ClusterError::NotEnoughReplicas`] is returned.
    pub fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), ClusterError> {
        if self.inner.config.replication_factor == 1 {
            self.inner
                .store
                .put(key, data, ttl)
                .map_err(|e| ClusterError::Storage(anyhow::Error::new(e)))?;
            return Ok(());
        }

        let expiry = self
            .inner
            .store
            .put(key, data.clone(), ttl)
            .map_err(|e| ClusterError::Storage(anyhow::Error::new(e)))?;

        replication::replicate_put(&self.inner, key, data, expiry)
    }

    /// Reads a key, trying local storage first and falling back to a
    /// single-hop broadcast across every known peer, returning the first
    /// positive reply. Times out with [`ClusterError::NotFound`].
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ClusterError> {
        let local = self
            .inner
            .store
            .get(key)
            .map_err(|e| ClusterError::Storage(anyhow::Error::new(e)))?;
        if let Some(data) = local {
            return Ok(data);
        }

        let peers = self.inner.peer_snapshot();
        if peers.is_empty() {
            return Err(ClusterError::NotFound);
        }

        let Some(queue) = self.inner.fanout_tx.read().clone() else {
            return Err(ClusterError::NotFound);
        };

        let (request, reply) = GetRequest::new(key);
        for peer in peers {
            let task = GetTask {
                node: peer,
                request: request.clone(),
            };
            let _ = queue.send_async(task).await;
        }

        // Fire-and-forget: peers that answer after the timeout hit the
        // request's already-taken slot and are absorbed silently.
        match tokio::time::timeout(self.inner.config.get_timeout(), reply).await {
            Ok(Ok(data)) => Ok(data),
            _ => Err(ClusterError::NotFound),
        }
    }

    /// Cluster-wide delete is intentionally unsupported by this design;
    /// callers must not depend on it.
    pub fn delete(&self, _key: &str) -> Result<(), ClusterError> {
        Err(ClusterError::DeleteUnsupported)
    }

    /// The identity this node carries in the cluster.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Access to the local storage engine.
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// The number of currently registered peers.
    pub fn peer_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// The identities of all currently registered peers.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.inner.registry.lock().ids()
    }

    /// Convenience for tests: waits until at least `count` peers are
    /// registered.
    pub async fn wait_for_peers(
        &self,
        count: usize,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error> {
        tokio::time::timeout(timeout_after, async {
            while self.peer_count() < count {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {count} peers"))
    }
}

impl<S: CacheStore> Drop for MeshCache<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shared cluster state, owned by the coordinator and referenced by every
/// peer connection and service task.
pub(crate) struct ClusterInner<S: CacheStore> {
    pub(crate) node_id: NodeId,
    pub(crate) config: ClusterConfig,
    pub(crate) store: Arc<S>,
    /// The membership registry, serialized by its own lock.
    pub(crate) registry: Mutex<Registry<Arc<RemoteNode<S>>>>,
    /// Identities with an outbound connection in flight, keyed to the
    /// address being dialed.
    pub(crate) pending: DashMap<NodeId, String>,
    /// The shared replication rotation cursor, independent of the registry
    /// lock.
    pub(crate) rotation: Mutex<usize>,
    discovery_tx: RwLock<Option<flume::Sender<ProposedPeer>>>,
    fanout_tx: RwLock<Option<flume::Sender<GetTask<S>>>>,
    shutdown: AtomicBool,
}

impl<S: CacheStore> ClusterInner<S> {
    pub(crate) fn new(node_id: NodeId, config: ClusterConfig, store: S) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            store: Arc::new(store),
            registry: Mutex::new(Registry::default()),
            pending: DashMap::new(),
            rotation: Mutex::new(0),
            discovery_tx: RwLock::new(None),
            fanout_tx: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// A consistent snapshot of all registered peers. May be stale by the
    /// time it is used; membership only ever grows monotonically from the
    /// perspective of a reader, so this is acceptable.
    pub(crate) fn peer_snapshot(&self) -> Vec<Arc<RemoteNode<S>>> {
        self.registry.lock().values()
    }

    /// Admission: registers a verified peer unless its identity is already
    /// present, returning the assigned registry index.
    pub(crate) fn event_verify_node(
        &self,
        id: &str,
        node: &Arc<RemoteNode<S>>,
    ) -> Option<usize> {
        let mut registry = self.registry.lock();
        if registry.contains(id) {
            return None;
        }

        let index = registry.insert(id.to_owned(), node.clone());
        self.pending.remove(id);
        info!(peer_id = %id, index, "added remote node into membership");
        Some(index)
    }

    /// A peer with a valid registry index has disconnected.
    pub(crate) fn event_node_disconnected(&self, index: usize) {
        let removed = self.registry.lock().remove(index);
        if let Some(id) = removed {
            info!(peer_id = %id, index, "removed remote node from membership");
        }
    }

    /// An outbound connection failed permanently before admission; clear
    /// its pending-connection bookkeeping.
    pub(crate) fn event_unable_to_connect(&self, id: Option<NodeId>) {
        if let Some(id) = id {
            self.pending.remove(&id);
        }
    }

    /// Feeds a gossip record to the discovery consumer. A no-op once
    /// shutdown has begun.
    pub(crate) async fn propose_peer(&self, peer: ProposedPeer) {
        if self.is_shutdown() {
            return;
        }

        let queue = self.discovery_tx.read().clone();
        if let Some(queue) = queue {
            let _ = queue.send_async(peer).await;
        }
    }

    /// The gossip announcements for every registered peer except `exclude`,
    /// skipping peers whose advertised address is not known yet.
    pub(crate) fn peer_announcements_excluding(
        &self,
        exclude: &str,
    ) -> Vec<PeerAnnouncement> {
        let entries = self.registry.lock().entries();
        entries
            .into_iter()
            .filter(|(id, _)| id != exclude)
            .filter_map(|(id, node)| {
                node.advertised_addr()
                    .map(|addr| PeerAnnouncement { id, addr })
            })
            .collect()
    }
}

/// The accept loop's circuit breaker: trips after
/// [`MAX_ACCEPT_FAILURES`] consecutive failures, any success resets the
/// count.
#[derive(Default)]
struct AcceptBreaker {
    consecutive_errors: u32,
}

impl AcceptBreaker {
    fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Records a failure, returning whether the breaker has tripped.
    fn record_failure(&mut self) -> bool {
        self.consecutive_errors += 1;
        self.consecutive_errors >= MAX_ACCEPT_FAILURES
    }
}

/// Accepts inbound peer connections until shutdown or until the circuit
/// breaker trips on five consecutive accept failures.
async fn run_listener<S: CacheStore>(
    cluster: Arc<ClusterInner<S>>,
    listener: TcpListener,
) {
    info!(node_id = %cluster.node_id, "node is up and running");

    let mut breaker = AcceptBreaker::default();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                breaker.record_success();
                if cluster.is_shutdown() {
                    break;
                }

                info!(remote_addr = %addr, "new connection from remote peer");
                let node = RemoteNode::new(
                    cluster.clone(),
                    RemoteNodeConfig {
                        id: None,
                        addr: addr.to_string(),
                        connect_retries: cluster.config.connect_retries,
                    },
                );
                node.start(stream);
            },
            Err(error) => {
                error!(error = %error, "failed to accept inbound connection");
                if breaker.record_failure() {
                    break;
                }
            },
        }
    }

    if cluster.is_shutdown() {
        return;
    }

    error!("listening loop terminated after repeated accept failures");
    if cluster.config.terminate_on_listener_exit {
        std::process::exit(1);
    }
}
