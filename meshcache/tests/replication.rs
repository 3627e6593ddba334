use std::time::Duration;

use meshcache::test_utils::MemStore;
use meshcache::{CacheStore, ClusterConfig, ClusterError, MeshCache};

fn make_config(node_id: &str, port: u16, replication_factor: usize) -> ClusterConfig {
    ClusterConfig {
        node_id: Some(node_id.to_string()),
        listen_port: port,
        replication_factor,
        ..Default::default()
    }
}

async fn connect_trio(
    replication_factor: usize,
) -> anyhow::Result<(MeshCache<MemStore>, MeshCache<MemStore>, MeshCache<MemStore>)> {
    let port_1 = test_helper::get_unused_addr().port();
    let port_2 = test_helper::get_unused_addr().port();
    let port_3 = test_helper::get_unused_addr().port();

    let node_1 = MeshCache::new(
        make_config("node-1", port_1, replication_factor),
        MemStore::default(),
    );
    node_1.start().await?;

    let config = ClusterConfig {
        join: true,
        seed_address: Some(format!("127.0.0.1:{port_1}")),
        ..make_config("node-2", port_2, 1)
    };
    let node_2 = MeshCache::new(config, MemStore::default());
    node_2.start().await?;

    let config = ClusterConfig {
        join: true,
        seed_address: Some(format!("127.0.0.1:{port_1}")),
        ..make_config("node-3", port_3, 1)
    };
    let node_3 = MeshCache::new(config, MemStore::default());
    node_3.start().await?;

    let wait = Duration::from_secs(15);
    node_1.wait_for_peers(2, wait).await?;
    node_2.wait_for_peers(2, wait).await?;
    node_3.wait_for_peers(2, wait).await?;
    Ok((node_1, node_2, node_3))
}

async fn connect_pair(
    replication_factor: usize,
) -> anyhow::Result<(MeshCache<MemStore>, MeshCache<MemStore>)> {
    let port_1 = test_helper::get_unused_addr().port();
    let port_2 = test_helper::get_unused_addr().port();

    let node_1 = MeshCache::new(
        make_config("node-1", port_1, replication_factor),
        MemStore::default(),
    );
    node_1.start().await?;

    let config = ClusterConfig {
        join: true,
        seed_address: Some(format!("127.0.0.1:{port_1}")),
        ..make_config("node-2", port_2, 1)
    };
    let node_2 = MeshCache::new(config, MemStore::default());
    node_2.start().await?;

    let wait = Duration::from_secs(10);
    node_1.wait_for_peers(1, wait).await?;
    node_2.wait_for_peers(1, wait).await?;
    Ok((node_1, node_2))
}

#[tokio::test]
async fn test_factor_one_generates_no_peer_traffic() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (node_1, node_2) = connect_pair(1).await?;

    node_1.put("user:1", b"Hello, world".to_vec(), None)?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        node_1.store().get("user:1").unwrap(),
        Some(b"Hello, world".to_vec()),
    );
    assert!(node_2.store().is_empty(), "No replica should be written.");

    node_1.shutdown();
    node_2.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_not_enough_replicas_keeps_local_write() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let port = test_helper::get_unused_addr().port();
    let node = MeshCache::new(make_config("node-1", port, 2), MemStore::default());
    node.start().await?;

    let err = node
        .put("user:1", b"Hello, world".to_vec(), None)
        .expect_err("A lone node can not replicate.");
    assert!(matches!(err, ClusterError::NotEnoughReplicas));

    // The local write already happened; the shortfall is reported, not
    // rolled back.
    assert_eq!(
        node.store().get("user:1").unwrap(),
        Some(b"Hello, world".to_vec()),
    );

    node.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_writes_rotate_across_peers() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (node_1, node_2, node_3) = connect_trio(2).await?;
    let wait = Duration::from_secs(15);

    // Factor 2 over two peers: each write lands on exactly one peer, and
    // the rotation cursor alternates the target.
    node_1.put("key-a", b"a".to_vec(), Some(Duration::from_secs(60)))?;
    node_1.put("key-b", b"b".to_vec(), Some(Duration::from_secs(60)))?;

    let replica_landed = |key: &'static str| {
        let found_2 = node_2.store().get(key).unwrap().is_some();
        let found_3 = node_3.store().get(key).unwrap().is_some();
        (found_2, found_3)
    };

    tokio::time::timeout(wait, async {
        loop {
            let (a_2, a_3) = replica_landed("key-a");
            let (b_2, b_3) = replica_landed("key-b");
            if (a_2 || a_3) && (b_2 || b_3) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Replicas should arrive.");

    let (a_2, a_3) = replica_landed("key-a");
    let (b_2, b_3) = replica_landed("key-b");
    assert!(a_2 ^ a_3, "Each write must land on exactly one peer.");
    assert!(b_2 ^ b_3, "Each write must land on exactly one peer.");
    assert_ne!(
        (a_2, a_3),
        (b_2, b_3),
        "Consecutive writes must rotate to different peers.",
    );

    // Replicas carry the origin's absolute expiry.
    let origin_expiry = node_1.store().expiry_of("key-a").unwrap();
    let replica_expiry = if a_2 {
        node_2.store().expiry_of("key-a").unwrap()
    } else {
        node_3.store().expiry_of("key-a").unwrap()
    };
    assert_eq!(origin_expiry, replica_expiry);

    node_1.shutdown();
    node_2.shutdown();
    node_3.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_oversized_write_does_not_tear_down_the_link() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (node_1, node_2, node_3) = connect_trio(2).await?;
    let wait = Duration::from_secs(15);

    // Larger than the wire codec's frame cap: the writer discards the frame
    // instead of poisoning the link with bytes the receiver must reject.
    node_1.put("huge", vec![0u8; 9 * 1024 * 1024], None)?;

    // Subsequent writes still replicate over both links.
    node_1.put("key-a", b"a".to_vec(), None)?;
    node_1.put("key-b", b"b".to_vec(), None)?;

    let landed = |key: &str| {
        node_2.store().get(key).unwrap().is_some()
            || node_3.store().get(key).unwrap().is_some()
    };

    tokio::time::timeout(wait, async {
        while !(landed("key-a") && landed("key-b")) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Replicas should still arrive after the oversized write.");

    assert_eq!(node_1.peer_count(), 2, "Both peer links must survive.");
    assert!(node_2.store().get("huge").unwrap().is_none());
    assert!(node_3.store().get("huge").unwrap().is_none());

    node_1.shutdown();
    node_2.shutdown();
    node_3.shutdown();
    Ok(())
}
