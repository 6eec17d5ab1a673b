//! Integration test: cluster formation.
//!
//! Storage nodes register with the tracker, learn their group members from
//! the heartbeat, and are reclaimed once they go away.

use std::time::Duration;

use reef_integration_tests::{ReefCluster, wait_for};
use reef_types::{InstanceRole, InstanceState};

/// Start 3 storage nodes, verify all 3 hold a registration.
#[tokio::test]
async fn test_3_node_registration() {
    let c = ReefCluster::new(3).await;
    for i in 0..c.len() {
        c.wait_registered(i).await;
    }

    let registry = c.tracker().registry();
    assert_eq!(registry.len().await, 3);
    let members = registry.group_members(InstanceRole::Storage, "group1").await;
    assert_eq!(members.len(), 3);
    for member in &members {
        assert_eq!(member.state, InstanceState::Hold);
        assert_eq!(member.bind_host, "127.0.0.1");
    }

    c.shutdown().await;
}

/// Every node eventually lists the other two as group members.
#[tokio::test]
async fn test_members_learn_each_other() {
    let c = ReefCluster::new(3).await;

    for i in 0..c.len() {
        let node = c.storage(i).node().clone();
        wait_for(Duration::from_secs(5), Duration::from_millis(20), || {
            let node = node.clone();
            async move { node.members().len() == 2 }
        })
        .await;

        let own = c.storage_id(i);
        assert!(
            node.members().iter().all(|m| m.instance_id != own),
            "node {i} should not list itself"
        );
    }

    c.shutdown().await;
}

/// A stopped node is released, then swept; the others stay held.
#[tokio::test]
async fn test_stopped_node_is_reclaimed() {
    let mut c = ReefCluster::new(2).await;
    c.wait_registered(0).await;
    c.wait_registered(1).await;

    let gone = c.storage_id(1);
    c.stop_storage(1).await;

    let registry = c.tracker().registry().clone();
    wait_for(Duration::from_secs(5), Duration::from_millis(20), || {
        let registry = registry.clone();
        let gone = gone.clone();
        async move { registry.get(&gone).await.is_none() }
    })
    .await;

    let kept = registry.get(&c.storage_id(0)).await.unwrap();
    assert_eq!(kept.state, InstanceState::Hold);

    c.shutdown().await;
}
