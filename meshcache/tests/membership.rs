use std::time::Duration;

use meshcache::test_utils::MemStore;
use meshcache::{ClusterConfig, ClusterError, MeshCache};

fn make_config(node_id: &str, port: u16) -> ClusterConfig {
    ClusterConfig {
        node_id: Some(node_id.to_string()),
        listen_port: port,
        ..Default::default()
    }
}

fn make_joining_config(node_id: &str, port: u16, seed_port: u16) -> ClusterConfig {
    ClusterConfig {
        join: true,
        seed_address: Some(format!("127.0.0.1:{seed_port}")),
        ..make_config(node_id, port)
    }
}

#[tokio::test]
async fn test_three_nodes_converge_to_full_mesh() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let port_1 = test_helper::get_unused_addr().port();
    let port_2 = test_helper::get_unused_addr().port();
    let port_3 = test_helper::get_unused_addr().port();

    let node_1 = MeshCache::new(make_config("node-1", port_1), MemStore::default());
    node_1.start().await?;

    // Nodes 2 and 3 only ever hear about each other through node 1's
    // gossip, never directly.
    let node_2 = MeshCache::new(
        make_joining_config("node-2", port_2, port_1),
        MemStore::default(),
    );
    node_2.start().await?;

    let node_3 = MeshCache::new(
        make_joining_config("node-3", port_3, port_1),
        MemStore::default(),
    );
    node_3.start().await?;

    let wait = Duration::from_secs(15);
    node_1.wait_for_peers(2, wait).await?;
    node_2.wait_for_peers(2, wait).await?;
    node_3.wait_for_peers(2, wait).await?;

    let mut seen = node_1.peer_ids();
    seen.sort();
    assert_eq!(seen, vec!["node-2".to_string(), "node-3".to_string()]);

    let mut seen = node_2.peer_ids();
    seen.sort();
    assert_eq!(seen, vec!["node-1".to_string(), "node-3".to_string()]);

    let mut seen = node_3.peer_ids();
    seen.sort();
    assert_eq!(seen, vec!["node-1".to_string(), "node-2".to_string()]);

    node_1.shutdown();
    node_2.shutdown();
    node_3.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_duplicate_identity_is_rejected() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let port_1 = test_helper::get_unused_addr().port();
    let port_2 = test_helper::get_unused_addr().port();
    let port_3 = test_helper::get_unused_addr().port();

    let node_1 = MeshCache::new(make_config("node-1", port_1), MemStore::default());
    node_1.start().await?;

    let node_2 = MeshCache::new(
        make_joining_config("node-2", port_2, port_1),
        MemStore::default(),
    );
    node_2.start().await?;
    node_1.wait_for_peers(1, Duration::from_secs(10)).await?;

    // A second node claiming an already registered identity must stay out
    // of node 1's membership.
    let imposter = MeshCache::new(
        make_joining_config("node-2", port_3, port_1),
        MemStore::default(),
    );
    imposter.start().await?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(node_1.peer_count(), 1);

    node_1.shutdown();
    node_2.shutdown();
    imposter.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_shutdown_deregisters_peers() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let port_1 = test_helper::get_unused_addr().port();
    let port_2 = test_helper::get_unused_addr().port();

    let node_1 = MeshCache::new(make_config("node-1", port_1), MemStore::default());
    node_1.start().await?;

    let node_2 = MeshCache::new(
        make_joining_config("node-2", port_2, port_1),
        MemStore::default(),
    );
    node_2.start().await?;

    let wait = Duration::from_secs(10);
    node_1.wait_for_peers(1, wait).await?;
    node_2.wait_for_peers(1, wait).await?;

    node_2.shutdown();
    // Repeated shutdowns are a no-op.
    node_2.shutdown();

    // Node 1 notices the dropped connection and deregisters the peer.
    tokio::time::timeout(wait, async {
        while node_1.peer_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Peer should be deregistered after disconnect.");

    node_1.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_start_rejects_fatal_misconfiguration() {
    let _ = tracing_subscriber::fmt::try_init();

    let node = MeshCache::new(make_config("node-1", 0), MemStore::default());
    let err = node.start().await.expect_err("Zero port must be rejected.");
    assert!(matches!(err, ClusterError::InvalidListenPort));

    let port = test_helper::get_unused_addr().port();
    let config = ClusterConfig {
        join: true,
        seed_address: None,
        ..make_config("node-1", port)
    };
    let node = MeshCache::new(config, MemStore::default());
    let err = node.start().await.expect_err("Missing seed must be rejected.");
    assert!(matches!(err, ClusterError::MissingSeedAddress));
}

#[tokio::test]
async fn test_delete_is_unsupported() {
    let node = MeshCache::new(make_config("node-1", 1), MemStore::default());
    let err = node.delete("any-key").expect_err("Delete has no behaviour.");
    assert!(matches!(err, ClusterError::DeleteUnsupported));
}
