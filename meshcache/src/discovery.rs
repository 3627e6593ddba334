//! Mesh discovery: the consumer side of the gossip queue.
//!
//! Every active peer forwards its own known-peer list onto this queue as
//! [`ProposedPeer`] records. For each record naming a node we do not already
//! know (or are not already connecting to), an outbound connection is
//! started. This eventually-consistent flooding is what converges the
//! cluster toward a full mesh without a directory service.

use std::sync::Arc;

use crate::remote::{RemoteNode, RemoteNodeConfig};
use crate::{CacheStore, ClusterInner, NodeId};

pub(crate) const DISCOVERY_QUEUE_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
/// A transient gossip record: "a peer I know about that you might not".
pub(crate) struct ProposedPeer {
    pub id: NodeId,
    pub addr: String,
}

/// Consumes proposed peers in arrival order and dials the unknown ones.
///
/// Exits once shutdown has dropped the queue sender.
pub(crate) async fn run_discovery<S: CacheStore>(
    cluster: Arc<ClusterInner<S>>,
    queue: flume::Receiver<ProposedPeer>,
) {
    while let Ok(peer) = queue.recv_async().await {
        if peer.id == cluster.node_id {
            continue;
        }

        if cluster.pending.contains_key(&peer.id) {
            warn!(peer_id = %peer.id, "peer already has a pending connection");
            continue;
        }

        if cluster.registry.lock().contains(&peer.id) {
            continue;
        }

        debug!(peer_id = %peer.id, addr = %peer.addr, "discovered new peer, connecting");

        // Mark the identity pending before the dial task exists so two
        // announcements of the same peer can never race into two attempts.
        cluster.pending.insert(peer.id.clone(), peer.addr.clone());

        let node = RemoteNode::new(
            cluster.clone(),
            RemoteNodeConfig {
                id: Some(peer.id),
                addr: peer.addr,
                connect_retries: cluster.config.connect_retries,
            },
        );
        tokio::spawn(node.join());
    }
    trace!("discovery consumer stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::MemStore;
    use crate::ClusterConfig;

    fn make_cluster() -> Arc<ClusterInner<MemStore>> {
        let mut config = ClusterConfig::default();
        let node_id = config.normalize();
        ClusterInner::new(node_id, config, MemStore::default())
    }

    #[tokio::test]
    async fn test_duplicate_announcements_start_one_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let cluster = make_cluster();
        let (tx, queue) = flume::bounded(DISCOVERY_QUEUE_CAPACITY);
        tokio::spawn(run_discovery(cluster.clone(), queue));

        // Nothing listens on this address, so the dial retry loop keeps the
        // identity in the pending tracker while we observe it.
        let addr = test_helper::get_unused_addr().to_string();
        for _ in 0..2 {
            tx.send_async(ProposedPeer {
                id: "node-x".to_string(),
                addr: addr.clone(),
            })
            .await
            .expect("Queue announcement");
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            cluster.pending.len(),
            1,
            "Duplicate announcements must share a single outbound attempt.",
        );
        assert_eq!(cluster.registry.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_own_identity_is_never_dialed() {
        let _ = tracing_subscriber::fmt::try_init();

        let cluster = make_cluster();
        let (tx, queue) = flume::bounded(DISCOVERY_QUEUE_CAPACITY);
        tokio::spawn(run_discovery(cluster.clone(), queue));

        tx.send_async(ProposedPeer {
            id: cluster.node_id.clone(),
            addr: "127.0.0.1:1".to_string(),
        })
        .await
        .expect("Queue announcement");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cluster.pending.is_empty());
        assert_eq!(cluster.registry.lock().len(), 0);
    }
}
