//! Integration test: replication.
//!
//! Files uploaded to one storage node reach the other members of its group
//! through the tracker catalog and the sync job.

use std::time::Duration;

use reef_integration_tests::{ReefCluster, test_data_seeded, wait_for};
use reef_node::jobs::cursor_name;
use reef_types::Digest;

/// Upload to node 0, read the same bytes back from nodes 1 and 2.
#[tokio::test]
async fn test_upload_replicates_to_group() {
    let c = ReefCluster::new(3).await;
    for i in 0..c.len() {
        c.wait_registered(i).await;
    }

    let data = test_data_seeded(50_000, 7);
    let digest = Digest::from_data(&data);
    let path = c.upload(0, &data, "dat").await;

    for i in 1..c.len() {
        c.wait_replicated(i, digest).await;
        assert_eq!(c.download(i, &path).await, data, "replica on node {i}");

        let node = c.storage(i).node().clone();
        wait_for(Duration::from_secs(5), Duration::from_millis(20), || {
            let node = node.clone();
            async move { node.meta().exists(&digest).unwrap() }
        })
        .await;
    }

    // Replicas are not re-registered with the tracker.
    assert_eq!(c.tracker().meta().catalog_len().unwrap(), 1);

    c.shutdown().await;
}

/// A node that joins later pulls the whole catalog.
#[tokio::test]
async fn test_late_joiner_catches_up() {
    let mut c = ReefCluster::new(1).await;
    c.wait_registered(0).await;

    let mut digests = Vec::new();
    for seed in 0..5 {
        let data = test_data_seeded(1000 + seed as usize * 100, seed);
        c.upload(0, &data, "").await;
        digests.push(Digest::from_data(&data));
    }

    let late = c.add_storage().await;
    for digest in &digests {
        c.wait_replicated(late, *digest).await;
    }

    let node = c.storage(late).node();
    let cursor = cursor_name(&node.trackers()[0]);
    wait_for(Duration::from_secs(5), Duration::from_millis(20), || {
        let node = node.clone();
        let cursor = cursor.clone();
        async move { node.meta().get_cursor(&cursor).unwrap() == 5 }
    })
    .await;

    c.shutdown().await;
}

/// When the owner is gone the cursor does not move past its file.
#[tokio::test]
async fn test_sync_waits_for_unreachable_owner() {
    let mut c = ReefCluster::new(1).await;
    c.wait_registered(0).await;

    let data = test_data_seeded(4000, 3);
    c.upload(0, &data, "").await;
    c.stop_storage(0).await;

    let late = c.add_storage().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let node = c.storage(late).node();
    assert!(!node.store().contains(&Digest::from_data(&data)).await.unwrap());
    let cursor = cursor_name(&node.trackers()[0]);
    assert_eq!(node.meta().get_cursor(&cursor).unwrap(), 0);

    c.shutdown().await;
}
