//! Coordinator loss and takeover by the highest-priority surviving node.

mod common;

use common::{assert_partitioned, get_at, replicas_converged, wait_until, TestCluster};
use ring_kv_core::{KvClient, NodeStatus, RingConfig, StorageNode};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(20);

fn fast_failover(config: &mut RingConfig) {
    config.coordinator.heartbeat_interval_ms = 100;
    config.coordinator.missed_heartbeats = 3;
    config.election.coordinator_timeout_ms = 600;
    config.election.reregister_attempts = 20;
    config.election.reregister_backoff_ms = 150;
    config.network.rpc_timeout_ms = 500;
}

async fn load(cluster: &TestCluster, count: usize) -> Vec<(String, String)> {
    let data: Vec<(String, String)> = (0..count)
        .map(|i| (format!("key{}", i), format!("value{}", i)))
        .collect();
    let mut client = cluster.client();
    for (key, value) in &data {
        client.put(key, value).await.unwrap();
    }
    data
}

/// Cluster nodes ordered by election priority, highest first.
async fn by_priority(cluster: &TestCluster) -> Vec<Arc<StorageNode>> {
    let ring = cluster.coordinator().ring_snapshot().await;
    let mut nodes = cluster.nodes.clone();
    nodes.sort_by_key(|n| std::cmp::Reverse(ring.get(&n.id()).unwrap().priority));
    nodes
}

#[tokio::test]
async fn test_highest_priority_node_takes_over() {
    let mut cluster = TestCluster::start_with(fast_failover).await;
    for _ in 0..3 {
        cluster.add_node().await;
    }
    let data = load(&cluster, 30).await;
    let ranked = by_priority(&cluster).await;
    let leader = &ranked[0];

    cluster.stop_coordinator();

    assert!(
        wait_until(WAIT, || async move {
            leader.is_acting_coordinator().await && leader.status().await == NodeStatus::Terminated
        })
        .await,
        "{} never took over",
        leader.name()
    );
    assert_eq!(leader.metrics().snapshot().elections_won, 1);

    let survivors = &ranked[1..];
    for node in survivors {
        assert!(
            wait_until(WAIT, || async move {
                match node.metadata().await {
                    Some(ring) => ring.size() == 2 && !ring.contains(&leader.id()),
                    None => false,
                }
            })
            .await
        );
        assert!(!node.is_acting_coordinator().await);
        assert_eq!(node.status().await, NodeStatus::Active);
    }
    assert_partitioned(&survivors[0].metadata().await.unwrap());

    let mut client = KvClient::new(survivors[0].name());
    for (key, value) in &data {
        assert_eq!(client.get(key).await.unwrap().value(), Some(value.as_str()), "{}", key);
    }
}

#[tokio::test]
async fn test_last_survivor_coordinates_itself() {
    let mut cluster = TestCluster::start_with(fast_failover).await;
    let node = cluster.add_node().await;
    let data = load(&cluster, 10).await;

    cluster.stop_coordinator();
    let watched = &node;
    assert!(wait_until(WAIT, || async move { watched.is_acting_coordinator().await }).await);
    assert_eq!(node.status().await, NodeStatus::Active);
    for (key, value) in &data {
        assert_eq!(get_at(&node, key).await.value(), Some(value.as_str()));
    }

    // The survivor now answers registrations on the rendezvous address.
    let joiner = cluster.add_node().await;
    let ring = joiner.metadata().await.unwrap();
    assert_eq!(ring.size(), 2);
    assert_partitioned(&ring);

    let mut client = KvClient::new(joiner.name());
    for (key, value) in &data {
        assert_eq!(client.get(key).await.unwrap().value(), Some(value.as_str()), "{}", key);
    }
}

#[tokio::test]
async fn test_takeover_skips_dead_leader_and_drops_it() {
    let mut cluster = TestCluster::start_with(fast_failover).await;
    for _ in 0..3 {
        cluster.add_node().await;
    }
    let data = load(&cluster, 30).await;
    let nodes = &cluster.nodes;
    assert!(wait_until(WAIT, || async move { replicas_converged(nodes).await }).await);

    let ranked = by_priority(&cluster).await;
    let (dead, runner_up, last) = (&ranked[0], &ranked[1], &ranked[2]);
    dead.halt().await;
    cluster.stop_coordinator();

    assert!(
        wait_until(WAIT, || async move {
            runner_up.is_acting_coordinator().await
                && runner_up.status().await == NodeStatus::Terminated
        })
        .await
    );
    assert!(
        wait_until(WAIT, || async move {
            match last.metadata().await {
                Some(ring) => ring.size() == 1 && ring.contains(&last.id()),
                None => false,
            }
        })
        .await
    );
    assert_partitioned(&last.metadata().await.unwrap());

    // The dead leader's keys come back from replica copies.
    for (key, value) in &data {
        assert_eq!(get_at(last, key).await.value(), Some(value.as_str()), "{}", key);
    }
}
