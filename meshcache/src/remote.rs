//! The per-peer connection state machine.
//!
//! One [`RemoteNode`] exists per cluster peer. It owns the socket and runs
//! `Connecting -> Handshake -> Verifying -> Active -> Terminated`:
//!
//! - Outbound attempts (seed join or discovery) start in `Connecting` and
//!   retry the dial up to the configured budget.
//! - Inbound sockets start in `Handshake` directly; the listener already
//!   performed the accept.
//! - Both sides send [`WireMessage::Verify`] as soon as the socket is up.
//!   Receiving the counterpart's identity moves to `Verifying`, where the
//!   coordinator admits the peer into the membership registry - the sole
//!   deduplication point for identities.
//! - Admission makes the link `Active`: the node gains a stable registry
//!   index and floods its known-peer list to the counterpart.
//! - Any I/O failure, failed admission, or explicit shutdown is terminal.
//!   A terminated node is deregistered and must never be reused.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::fanout::GetRequest;
use crate::wire::{self, WireMessage};
use crate::{CacheStore, ClusterInner, NodeId};

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    /// Outbound dial in progress.
    Connecting,
    /// Socket established, identity exchange pending.
    Handshake,
    /// Candidate identity received, admission in progress.
    Verifying,
    /// Registered in the membership registry, carrying traffic.
    Active,
    /// Socket closed and deregistered. Terminal.
    Terminated,
}

pub(crate) struct RemoteNodeConfig {
    /// The identity this peer is expected to hold, when already known from
    /// gossip. Inbound and seed connections start unauthenticated.
    pub id: Option<NodeId>,
    pub addr: String,
    pub connect_retries: u32,
}

pub(crate) struct RemoteNode<S: CacheStore> {
    cluster: Arc<ClusterInner<S>>,
    config: RemoteNodeConfig,
    /// The identity received during the handshake.
    id: Mutex<Option<NodeId>>,
    /// The dialable listen address the peer advertised, used for gossip.
    advertised_addr: Mutex<Option<String>>,
    state: Mutex<NodeState>,
    /// The registry index, valid only while registered.
    index: Mutex<Option<usize>>,
    writer: Mutex<Option<flume::Sender<WireMessage>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    pending_gets: Mutex<HashMap<u64, Arc<GetRequest>>>,
    next_request_id: AtomicU64,
    terminated: AtomicBool,
}

impl<S: CacheStore> RemoteNode<S> {
    pub(crate) fn new(
        cluster: Arc<ClusterInner<S>>,
        config: RemoteNodeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            config,
            id: Mutex::new(None),
            advertised_addr: Mutex::new(None),
            state: Mutex::new(NodeState::Connecting),
            index: Mutex::new(None),
            writer: Mutex::new(None),
            reader_task: Mutex::new(None),
            pending_gets: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
        })
    }

    /// The verified identity, or the one gossip promised if the handshake
    /// has not completed yet.
    pub(crate) fn identity(&self) -> Option<NodeId> {
        self.id.lock().clone().or_else(|| self.config.id.clone())
    }

    pub(crate) fn advertised_addr(&self) -> Option<String> {
        self.advertised_addr.lock().clone()
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    /// Dials the peer, retrying up to the configured budget, and starts the
    /// connection on success. On permanent failure the node is terminated
    /// and its pending-connection bookkeeping cleared.
    pub(crate) async fn join(self: Arc<Self>) {
        self.set_state(NodeState::Connecting);

        let mut attempts = 0u32;
        loop {
            if self.cluster.is_shutdown() {
                break;
            }

            match TcpStream::connect(&self.config.addr).await {
                Ok(stream) => {
                    self.start(stream);
                    return;
                },
                Err(error) => {
                    attempts += 1;
                    warn!(
                        addr = %self.config.addr,
                        attempt = attempts,
                        error = %error,
                        "unable to connect to peer",
                    );
                    if attempts > self.config.connect_retries {
                        break;
                    }
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                },
            }
        }

        if !self.cluster.is_shutdown() {
            error!(addr = %self.config.addr, "giving up connecting to peer");
        }
        self.terminate();
    }

    /// Brings an established socket up: spawns the writer and reader tasks
    /// and opens the handshake by announcing the local identity.
    pub(crate) fn start(self: Arc<Self>, stream: TcpStream) {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(error = %error, "failed to set TCP_NODELAY on peer socket");
        }

        let (reader, writer) = stream.into_split();
        let (tx, rx) = flume::unbounded();
        *self.writer.lock() = Some(tx);
        self.set_state(NodeState::Handshake);

        tokio::spawn(run_writer(self.clone(), writer, rx));

        self.send(WireMessage::Verify {
            id: self.cluster.node_id.clone(),
            addr: self.cluster.config.advertised_addr(),
        });

        let handle = tokio::spawn(self.clone().run_reader(reader));
        *self.reader_task.lock() = Some(handle);
    }

    /// Queues a message for the writer task. Dropped silently when the
    /// connection is not established.
    pub(crate) fn send(&self, msg: WireMessage) {
        let writer = self.writer.lock().clone();
        if let Some(tx) = writer {
            let _ = tx.send(msg);
        }
    }

    /// Issues a `GetReq` on behalf of a local cache miss. The reply comes
    /// back through the message loop and races the request's shared slot.
    pub(crate) fn request_get(&self, request: &Arc<GetRequest>) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending_gets
            .lock()
            .insert(request_id, request.clone());
        self.send(WireMessage::GetReq {
            request_id,
            key: request.key().to_owned(),
        });
    }

    async fn run_reader(self: Arc<Self>, mut reader: OwnedReadHalf) {
        loop {
            match wire::read_frame(&mut reader).await {
                Ok(msg) => Self::handle_message(&self, msg).await,
                Err(error) => {
                    debug!(
                        peer_id = ?self.identity(),
                        error = %error,
                        "peer connection closed",
                    );
                    break;
                },
            }

            if *self.state.lock() == NodeState::Terminated {
                break;
            }
        }
        self.terminate();
    }

    async fn handle_message(node: &Arc<Self>, msg: WireMessage) {
        match msg {
            WireMessage::Verify { id, addr } => Self::handle_verify(node, id, addr),
            WireMessage::PeerList { peers } => {
                for peer in peers {
                    node.cluster
                        .propose_peer(crate::discovery::ProposedPeer {
                            id: peer.id,
                            addr: peer.addr,
                        })
                        .await;
                }
            },
            WireMessage::Put { key, data, expiry } => {
                if let Err(error) = node.cluster.store.put_with_expiry(&key, data, expiry)
                {
                    warn!(key = %key, error = %error, "failed to store replicated value");
                }
            },
            WireMessage::GetReq { request_id, key } => {
                let data = match node.cluster.store.get(&key) {
                    Ok(data) => data,
                    Err(error) => {
                        warn!(key = %key, error = %error, "local lookup for peer failed");
                        None
                    },
                };
                node.send(WireMessage::GetRsp { request_id, data });
            },
            WireMessage::GetRsp { request_id, data } => {
                let request = node.pending_gets.lock().remove(&request_id);
                if let (Some(request), Some(data)) = (request, data) {
                    request.complete(data);
                }
            },
        }
    }

    /// Runs admission for a received identity: the single place where
    /// duplicate identities are rejected.
    fn handle_verify(node: &Arc<Self>, id: NodeId, addr: String) {
        if id == node.cluster.node_id {
            warn!(addr = %node.config.addr, "node connected to itself, dropping link");
            node.terminate();
            return;
        }

        node.set_state(NodeState::Verifying);
        *node.id.lock() = Some(id.clone());
        *node.advertised_addr.lock() = Some(addr);

        match node.cluster.event_verify_node(&id, node) {
            Some(index) => {
                *node.index.lock() = Some(index);
                node.set_state(NodeState::Active);
                info!(peer_id = %id, index, "peer is now active");

                // Flood our membership view to the new peer; this is what
                // drives the mesh toward convergence.
                let peers = node.cluster.peer_announcements_excluding(&id);
                if !peers.is_empty() {
                    node.send(WireMessage::PeerList { peers });
                }
            },
            None => {
                warn!(peer_id = %id, "peer identity already registered, dropping link");
                node.terminate();
            },
        }
    }

    /// Tears the connection down. Idempotent and terminal: the node is
    /// deregistered (or its pending-connection entry cleared) and must not
    /// be reused afterwards.
    pub(crate) fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_state(NodeState::Terminated);

        // Dropping the sender stops the writer task once it has drained.
        drop(self.writer.lock().take());
        self.pending_gets.lock().clear();

        match self.index.lock().take() {
            Some(index) => self.cluster.event_node_disconnected(index),
            None => self.cluster.event_unable_to_connect(self.identity()),
        }

        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
    }
}

/// Writes queued frames to the socket until the queue closes or the socket
/// fails.
async fn run_writer<S: CacheStore>(
    node: Arc<RemoteNode<S>>,
    mut writer: OwnedWriteHalf,
    queue: flume::Receiver<WireMessage>,
) {
    use tokio::io::AsyncWriteExt;

    while let Ok(msg) = queue.recv_async().await {
        if let Err(error) = wire::write_frame(&mut writer, &msg).await {
            // Codec rejections (an unserializable or oversized frame) only
            // discard the offending message; the link itself is still
            // healthy and nothing has reached the socket.
            if error.kind() == io::ErrorKind::InvalidData {
                warn!(
                    peer_id = ?node.identity(),
                    error = %error,
                    "discarding frame rejected by the wire codec",
                );
                continue;
            }

            debug!(
                peer_id = ?node.identity(),
                error = %error,
                "failed writing frame to peer",
            );
            node.terminate();
            break;
        }
    }

    let _ = writer.shutdown().await;
}
