//! The replication write path.
//!
//! A local write with a replication factor above 1 is mirrored to
//! `factor - 1` peers picked by round-robin rotation over the current
//! membership. The rotation cursor is shared by all writers and guarded by
//! its own lock, independent of the registry lock, so concurrent writes
//! spread across peers instead of always hitting the same subset. The peer
//! snapshot is taken before the cursor lock; peers that churn mid-write are
//! tolerated (best-effort, not transactional).

use crate::wire::WireMessage;
use crate::{CacheStore, ClusterError, ClusterInner};

/// Forwards a locally applied write to `replication_factor - 1` peers.
///
/// The local write has already happened by the time this is called; a
/// membership shortfall is reported as [`ClusterError::NotEnoughReplicas`]
/// rather than silently degrading.
pub(crate) fn replicate_put<S: CacheStore>(
    cluster: &ClusterInner<S>,
    key: &str,
    data: Vec<u8>,
    expiry: u64,
) -> Result<(), ClusterError> {
    let peers = cluster.peer_snapshot();
    if peers.len() < cluster.config.replication_factor {
        return Err(ClusterError::NotEnoughReplicas);
    }

    let mut cursor = cluster.rotation.lock();
    let targets =
        rotation_indices(&mut cursor, peers.len(), cluster.config.replication_factor - 1);
    for slot in targets {
        peers[slot].send(WireMessage::Put {
            key: key.to_owned(),
            data: data.clone(),
            expiry,
        });
    }

    Ok(())
}

/// Advances the shared rotation cursor, yielding the peer slots the next
/// `count` sends should target.
fn rotation_indices(cursor: &mut usize, peers: usize, count: usize) -> Vec<usize> {
    let mut targets = Vec::with_capacity(count);
    for _ in 0..count {
        targets.push(*cursor % peers);
        *cursor = (*cursor + 1) % peers;
    }
    targets
}
