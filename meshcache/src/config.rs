use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::NodeId;

const DEFAULT_GET_TIMEOUT_SECS: u64 = 3;
const DEFAULT_CONNECT_RETRIES: u32 = 5;
const NODE_ID_LENGTH: usize = 32;

#[derive(Debug, Clone)]
/// Configuration for a cluster node.
///
/// Everything here is fixed once the node has been started. Out-of-range
/// values for the replication factor and get timeout are corrected with a
/// warning rather than rejected; only a missing listen port or a missing
/// seed address (when `join` is set) cause [`start`](crate::MeshCache::start)
/// to fail.
pub struct ClusterConfig {
    /// A unique ID for this node within the cluster.
    ///
    /// Synthesized as a random token when absent.
    pub node_id: Option<String>,

    /// The TCP port this node listens on for peer connections.
    pub listen_port: u16,

    /// Bind the listener on all interfaces rather than the first local
    /// address.
    pub bind_all: bool,

    /// The local addresses of this machine.
    ///
    /// The first entry is broadcast to peers as this node's dialable address.
    pub local_addresses: Vec<String>,

    /// Whether to join an existing cluster on start.
    pub join: bool,

    /// The `host:port` of the seed peer to join.
    pub seed_address: Option<String>,

    /// How many times an outbound dial is retried before the peer is given
    /// up on.
    pub connect_retries: u32,

    /// Treat the accept loop tripping its circuit breaker as fatal to the
    /// process rather than running on degraded (no new inbound peers).
    pub terminate_on_listener_exit: bool,

    /// The number of copies (origin + replicas) maintained for a written key.
    ///
    /// A factor of 1 means writes never generate peer traffic.
    pub replication_factor: usize,

    /// Reserved: block writes until replicas confirm receipt.
    ///
    /// Accepted but not wired to any behaviour yet.
    pub write_ack: bool,

    /// How long a cluster-wide read waits for the first peer reply.
    pub get_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_port: 0,
            bind_all: false,
            local_addresses: Vec::new(),
            join: false,
            seed_address: None,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            terminate_on_listener_exit: false,
            replication_factor: 1,
            write_ack: false,
            get_timeout_secs: DEFAULT_GET_TIMEOUT_SECS,
        }
    }
}

impl ClusterConfig {
    /// Corrects out-of-range values and fills in the node identity,
    /// returning it.
    pub(crate) fn normalize(&mut self) -> NodeId {
        if self.replication_factor < 1 {
            warn!("adjusting replication factor to 1 (no replication) because it was less than 1");
            self.replication_factor = 1;
        }

        if self.get_timeout_secs < 1 {
            warn!(
                default_secs = DEFAULT_GET_TIMEOUT_SECS,
                "adjusting get timeout to the default because it was less than 1 second",
            );
            self.get_timeout_secs = DEFAULT_GET_TIMEOUT_SECS;
        }

        match self.node_id.clone() {
            Some(id) => id,
            None => {
                let id = generate_node_id(NODE_ID_LENGTH);
                info!(node_id = %id, "generated cluster node id");
                self.node_id = Some(id.clone());
                id
            },
        }
    }

    pub(crate) fn get_timeout(&self) -> Duration {
        Duration::from_secs(self.get_timeout_secs)
    }

    /// The address the listener binds on.
    pub(crate) fn bind_addr(&self) -> String {
        let host = if self.bind_all {
            "0.0.0.0"
        } else {
            self.first_local_host()
        };
        format!("{host}:{port}", port = self.listen_port)
    }

    /// The dialable address broadcast to peers in gossip announcements.
    pub(crate) fn advertised_addr(&self) -> String {
        format!(
            "{host}:{port}",
            host = self.first_local_host(),
            port = self.listen_port,
        )
    }

    fn first_local_host(&self) -> &str {
        self.local_addresses
            .first()
            .map(|addr| addr.as_str())
            .unwrap_or("127.0.0.1")
    }
}

/// Generates a random alphanumeric token used as a node identity before the
/// node has ever connected to the cluster.
fn generate_node_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
