//! Membership, migration and routing across a live in-process cluster.

mod common;

use async_trait::async_trait;
use common::{
    assert_partitioned, get_at, put_at, replicas_converged, rings_settled, wait_until, TestCluster,
};
use ring_kv_core::metrics::MetricsSnapshot;
use ring_kv_core::protocol::{ClientResponse, EcsAction, EcsMessage, PeerMessage};
use ring_kv_core::ring::node_name;
use ring_kv_core::transport::send_ecs;
use ring_kv_core::{HashRange, KeyHash, KvError, NodeStatus, PeerTransport, Result, TcpTransport};
use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

const WAIT: Duration = Duration::from_secs(10);

fn keys(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| (format!("key{}", i), format!("value{}", i)))
        .collect()
}

/// Drops every APPEND, as if the link to the destination broke mid-migration.
struct RefuseAppend {
    inner: TcpTransport,
}

#[async_trait]
impl PeerTransport for RefuseAppend {
    async fn request(&self, address: &str, message: PeerMessage, timeout: Duration) -> Result<PeerMessage> {
        if let PeerMessage::Ecs(ecs) = &message {
            if ecs.action == EcsAction::Append {
                return Err(KvError::Connection(format!("{}: link down", address)));
            }
        }
        self.inner.request(address, message, timeout).await
    }
}

#[tokio::test]
async fn test_single_node_owns_everything() {
    let mut cluster = TestCluster::start().await;
    let node = cluster.add_node().await;

    assert_eq!(node.status().await, NodeStatus::Active);
    let ring = cluster.coordinator().ring_snapshot().await;
    assert_eq!(ring.size(), 1);
    assert_partitioned(&ring);
    assert!(ring.get(&node.id()).unwrap().range.is_full());

    let mut client = cluster.client();
    assert!(matches!(client.put("a", "1").await.unwrap(), ClientResponse::PutSuccess { .. }));
    assert!(matches!(client.put("a", "2").await.unwrap(), ClientResponse::PutUpdate { .. }));
    assert_eq!(client.get("a").await.unwrap().value(), Some("2"));
    assert!(matches!(client.delete("a").await.unwrap(), ClientResponse::DeleteSuccess { .. }));
    assert!(matches!(client.delete("a").await.unwrap(), ClientResponse::DeleteError { .. }));
    assert!(matches!(client.get("a").await.unwrap(), ClientResponse::GetError { .. }));
}

#[tokio::test]
async fn test_values_with_spaces_survive() {
    let mut cluster = TestCluster::start().await;
    cluster.add_node().await;
    let mut client = cluster.client();

    client.put("greeting", "hello big world").await.unwrap();
    assert_eq!(client.get("greeting").await.unwrap().value(), Some("hello big world"));

    client.put("spaced", "a  b\tc").await.unwrap();
    // Push it out of the cache so the value round-trips through the file.
    for i in 0..5 {
        client.put(&format!("filler{}", i), "x").await.unwrap();
    }
    assert_eq!(client.get("spaced").await.unwrap().value(), Some("a  b\tc"));
}

#[tokio::test]
async fn test_joins_keep_ring_partitioned_and_move_keys() {
    let mut cluster = TestCluster::start().await;
    cluster.add_node().await;
    let data = keys(40);
    let mut client = cluster.client();
    for (key, value) in &data {
        client.put(key, value).await.unwrap();
    }

    cluster.add_node().await;
    cluster.add_node().await;
    let ring = cluster.coordinator().ring_snapshot().await;
    assert_eq!(ring.size(), 3);
    assert_partitioned(&ring);
    for node in &cluster.nodes {
        assert_eq!(node.metadata().await.unwrap(), ring);
        assert_eq!(node.status().await, NodeStatus::Active);
    }

    // Each key lives on exactly its owner; everyone else redirects.
    for (key, value) in &data {
        let owner = ring.responsible_for_key(key).unwrap().name();
        for node in &cluster.nodes {
            let response = get_at(node, key).await;
            if node.name() == owner {
                assert_eq!(response.value(), Some(value.as_str()), "{} on {}", key, owner);
            } else {
                assert!(matches!(response, ClientResponse::ServerNotResponsible { .. }));
            }
        }
    }
}

#[tokio::test]
async fn test_not_responsible_metadata_routes_to_owner() {
    let mut cluster = TestCluster::start().await;
    for _ in 0..3 {
        cluster.add_node().await;
    }

    for (key, _) in keys(20) {
        for node in &cluster.nodes {
            if let ClientResponse::ServerNotResponsible { metadata } = get_at(node, &key).await {
                let ring = ring_kv_core::HashRing::from_keyrange(&metadata).unwrap();
                let owner = ring.responsible_for_key(&key).unwrap();
                assert!(owner.range.contains_key(&key));
                let answer = get_at(cluster.node_named(&owner.name()), &key).await;
                assert!(matches!(answer, ClientResponse::GetError { .. }));
            }
        }
    }
}

#[tokio::test]
async fn test_end_to_end_join_scenario() {
    let mut cluster = TestCluster::start().await;
    let a = cluster.add_node().await;
    assert!(matches!(put_at(&a, "x", "1").await, ClientResponse::PutSuccess { .. }));

    let b = cluster.add_node().await;
    let ring = cluster.coordinator().ring_snapshot().await;
    let owner = ring.responsible_for_key("x").unwrap();

    match get_at(&a, "x").await {
        ClientResponse::GetSuccess { value, .. } => {
            assert_eq!(owner.id, a.id());
            assert_eq!(value, "1");
        }
        ClientResponse::ServerNotResponsible { metadata } => {
            assert_eq!(owner.id, b.id());
            let routed = ring_kv_core::HashRing::from_keyrange(&metadata).unwrap();
            assert_eq!(routed.responsible_for_key("x").unwrap().id, b.id());
        }
        other => panic!("unexpected reply {}", other),
    }
    let correct = cluster.node_named(&owner.name());
    assert_eq!(get_at(correct, "x").await.value(), Some("1"));

    let mut client = cluster.client();
    assert_eq!(client.get("x").await.unwrap().value(), Some("1"));
}

#[tokio::test]
async fn test_graceful_leave_merges_into_successor() {
    let mut cluster = TestCluster::start().await;
    for _ in 0..3 {
        cluster.add_node().await;
    }
    let data = keys(30);
    let mut client = cluster.client();
    for (key, value) in &data {
        client.put(key, value).await.unwrap();
    }

    let leaving = Arc::clone(&cluster.nodes[1]);
    let before = cluster.coordinator().ring_snapshot().await;
    let successor = before.successor(&leaving.id()).unwrap().clone();
    let leaving_range = before.get(&leaving.id()).unwrap().range;

    leaving.leave().await.unwrap();
    assert_eq!(leaving.status().await, NodeStatus::Terminated);
    assert!(matches!(get_at(&leaving, "key0").await, ClientResponse::ServerStopped));
    assert!(leaving.primary_entries().await.unwrap().is_empty());

    let after = cluster.coordinator().ring_snapshot().await;
    assert_eq!(after.size(), 2);
    assert!(!after.contains(&leaving.id()));
    assert_partitioned(&after);
    assert_eq!(after.get(&successor.id).unwrap().range.low, leaving_range.low);

    let heir = cluster.node_named(&successor.name());
    for (key, value) in &data {
        if leaving_range.contains_key(key) {
            assert_eq!(get_at(heir, key).await.value(), Some(value.as_str()));
        }
    }
    let mut client = cluster.client();
    for (key, value) in &data {
        assert_eq!(client.get(key).await.unwrap().value(), Some(value.as_str()), "{}", key);
    }
}

#[tokio::test]
async fn test_write_lock_blocks_puts_only() {
    let mut cluster = TestCluster::start().await;
    let node = cluster.add_node().await;
    put_at(&node, "a", "1").await;
    let transport = TcpTransport::new();
    let limit = Duration::from_secs(2);

    let reply = send_ecs(&transport, node.name(), EcsMessage::new(EcsAction::SetWriteLock), limit)
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(node.status().await, NodeStatus::WriteLocked);

    let again = send_ecs(&transport, node.name(), EcsMessage::new(EcsAction::SetWriteLock), limit)
        .await
        .unwrap();
    assert!(!again.success);

    assert!(matches!(put_at(&node, "a", "2").await, ClientResponse::ServerWriteLock));
    assert!(matches!(put_at(&node, "a", "null").await, ClientResponse::ServerWriteLock));
    assert_eq!(get_at(&node, "a").await.value(), Some("1"));

    let reply = send_ecs(&transport, node.name(), EcsMessage::new(EcsAction::UnsetWriteLock), limit)
        .await
        .unwrap();
    assert!(reply.success);
    assert!(matches!(put_at(&node, "a", "2").await, ClientResponse::PutUpdate { .. }));

    let unlocked = send_ecs(&transport, node.name(), EcsMessage::new(EcsAction::UnsetWriteLock), limit)
        .await
        .unwrap();
    assert!(!unlocked.success);
    let remove = EcsMessage::new(EcsAction::Remove).with_range(HashRange::full(KeyHash::MIN));
    assert!(!send_ecs(&transport, node.name(), remove, limit).await.unwrap().success);
}

#[tokio::test]
async fn test_failed_append_leaves_source_owning_data() {
    let mut cluster = TestCluster::start().await;
    let config = cluster.config.clone();
    let source = cluster
        .try_add_node(config.clone(), Arc::new(RefuseAppend { inner: TcpTransport::new() }))
        .await
        .unwrap();
    let data = keys(20);
    for (key, value) in &data {
        put_at(&source, key, value).await;
    }

    let mut joiner_config = config;
    joiner_config.election.reregister_attempts = 1;
    let joined = cluster
        .try_add_node(joiner_config, Arc::new(TcpTransport::new()))
        .await;
    assert!(joined.is_err());

    let ring = cluster.coordinator().ring_snapshot().await;
    assert_eq!(ring.size(), 1);
    assert!(ring.get(&source.id()).unwrap().range.is_full());
    assert_eq!(cluster.coordinator().metrics().snapshot().migrations_failed, 1);

    for (key, value) in &data {
        assert_eq!(get_at(&source, key).await.value(), Some(value.as_str()));
    }
    // The aborted migration keeps its locks until an operator clears them.
    assert_eq!(source.status().await, NodeStatus::WriteLocked);
    assert!(matches!(put_at(&source, "key0", "new").await, ClientResponse::ServerWriteLock));
}

#[tokio::test]
async fn test_replicas_converge_and_serve_reads() {
    let mut cluster = TestCluster::start_with(|config| config.node.serve_replica_reads = true).await;
    for _ in 0..3 {
        cluster.add_node().await;
    }
    let data = keys(25);
    let mut client = cluster.client();
    for (key, value) in &data {
        client.put(key, value).await.unwrap();
    }
    client.delete("key3").await.unwrap();

    let nodes = &cluster.nodes;
    assert!(wait_until(WAIT, || async move { replicas_converged(nodes).await }).await);

    // Three nodes: every node's read range is the whole ring.
    for (key, value) in &data {
        for node in &cluster.nodes {
            let response = get_at(node, key).await;
            if key == "key3" {
                assert!(matches!(response, ClientResponse::GetError { .. }));
            } else {
                assert_eq!(response.value(), Some(value.as_str()), "{} on {}", key, node.name());
            }
        }
    }
}

#[tokio::test]
async fn test_replica_refuses_direct_puts() {
    let mut cluster = TestCluster::start_with(|config| config.node.serve_replica_reads = true).await;
    cluster.add_node().await;
    cluster.add_node().await;
    let ring = cluster.coordinator().ring_snapshot().await;

    for (key, value) in keys(10) {
        let owner = ring.responsible_for_key(&key).unwrap().id;
        let replica = cluster.nodes.iter().find(|n| n.id() != owner).unwrap();
        assert!(matches!(
            put_at(replica, &key, &value).await,
            ClientResponse::ServerNotResponsible { .. }
        ));
    }
}

#[tokio::test]
async fn test_silent_node_is_dropped_and_replicas_take_over() {
    let mut cluster = TestCluster::start().await;
    for _ in 0..3 {
        cluster.add_node().await;
    }
    let data = keys(30);
    let mut client = cluster.client();
    for (key, value) in &data {
        client.put(key, value).await.unwrap();
    }
    let nodes = &cluster.nodes;
    assert!(wait_until(WAIT, || async move { replicas_converged(nodes).await }).await);

    let victim = Arc::clone(&cluster.nodes[2]);
    victim.halt().await;

    let coordinator = cluster.coordinator();
    assert!(
        wait_until(WAIT, || async move { coordinator.ring_snapshot().await.size() == 2 }).await
    );
    let ring = coordinator.ring_snapshot().await;
    assert_partitioned(&ring);
    assert!(coordinator.metrics().snapshot().heartbeats_missed >= 1);

    let survivors: Vec<_> = cluster.nodes[..2].to_vec();
    for node in &survivors {
        let expected = ring.clone();
        assert!(
            wait_until(WAIT, || {
                let expected = expected.clone();
                async move { node.metadata().await == Some(expected) }
            })
            .await
        );
    }

    let mut client = ring_kv_core::KvClient::new(survivors[0].name());
    for (key, value) in &data {
        assert_eq!(client.get(key).await.unwrap().value(), Some(value.as_str()), "{}", key);
    }
}

#[tokio::test]
async fn test_key_deleted_after_join_stays_deleted_when_ring_shrinks() {
    let mut cluster = TestCluster::start_with(|config| config.node.serve_replica_reads = true).await;
    for _ in 0..3 {
        cluster.add_node().await;
    }

    // Bind the joiner up front so the range it will take over is known.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let joiner_id = KeyHash::of(&node_name("127.0.0.1", listener.local_addr().unwrap().port()));
    let ring = cluster.coordinator().ring_snapshot().await;
    let source_name = ring.responsible_node(&joiner_id).unwrap().name();
    let moving = HashRange::new(ring.predecessor(&joiner_id).unwrap().id, joiner_id);
    let key = (0u32..)
        .map(|i| format!("moved{}", i))
        .find(|k| moving.contains_key(k))
        .unwrap();

    let mut client = cluster.client();
    client.put(&key, "old").await.unwrap();
    let nodes = &cluster.nodes;
    assert!(wait_until(WAIT, || async move { replicas_converged(nodes).await }).await);

    let config = cluster.config.clone();
    let joiner = cluster
        .start_node(config, Arc::new(TcpTransport::new()), listener)
        .await
        .unwrap();
    let source = Arc::clone(cluster.node_named(&source_name));
    assert!(matches!(
        put_at(&joiner, &key, "null").await,
        ClientResponse::DeleteSuccess { .. }
    ));

    // The source re-syncs its shrunk range, so no replica keeps the moved key.
    let nodes = &cluster.nodes;
    assert!(
        wait_until(WAIT, || async move {
            rings_settled(nodes, 4).await && replicas_converged(nodes).await
        })
        .await
    );
    for node in &cluster.nodes {
        assert_eq!(get_at(node, &key).await.value(), None, "{}", node.name());
    }

    joiner.halt().await;
    let coordinator = cluster.coordinator();
    assert!(
        wait_until(WAIT, || async move { coordinator.ring_snapshot().await.size() == 3 }).await
    );
    source.halt().await;
    assert!(
        wait_until(WAIT, || async move { coordinator.ring_snapshot().await.size() == 2 }).await
    );

    let survivors: Vec<_> = cluster
        .nodes
        .iter()
        .filter(|n| n.id() != joiner.id() && n.id() != source.id())
        .cloned()
        .collect();
    let settled = &survivors;
    assert!(wait_until(WAIT, || async move { rings_settled(settled, 2).await }).await);

    for node in &survivors {
        let entries = node.primary_entries().await.unwrap();
        assert!(entries.iter().all(|(k, _)| k != &key), "{} revived {}", node.name(), key);
        assert!(matches!(get_at(node, &key).await, ClientResponse::GetError { .. }));
    }
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let mut cluster = TestCluster::start_with(|config| config.network.max_line_bytes = 4096).await;
    let node = cluster.add_node().await;

    let stream = TcpStream::connect(node.name()).await.unwrap();
    let mut framed = Framed::new(stream, LinesCodec::new());
    let _ = framed.send(format!("put big {}", "x".repeat(16 * 1024))).await;
    assert!(!matches!(framed.next().await, Some(Ok(_))));

    // The node keeps serving other connections.
    assert!(matches!(put_at(&node, "small", "v").await, ClientResponse::PutSuccess { .. }));
    assert!(matches!(get_at(&node, "big").await, ClientResponse::GetError { .. }));
}

#[tokio::test]
async fn test_keyrange_and_stats() {
    let mut cluster = TestCluster::start().await;
    cluster.add_node().await;
    cluster.add_node().await;
    let mut client = cluster.client();

    let ring = client.refresh_metadata().await.unwrap();
    assert_eq!(ring.size(), 2);
    assert_partitioned(&ring);

    client.put("k", "v").await.unwrap();
    client.get("k").await.unwrap();
    client.get("missing").await.unwrap();

    let mut total = 0;
    for node in &cluster.nodes {
        let response = ring_kv_core::KvClient::new(node.name()).stats().await.unwrap();
        let ClientResponse::Stats { json } = response else {
            panic!("expected STATS");
        };
        let snapshot: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        total += snapshot.gets;
    }
    assert!(total >= 2);

    match client.keyrange_read().await.unwrap() {
        ClientResponse::KeyRangeReadSuccess { ranges } => assert_eq!(ranges.split(';').count(), 2),
        other => panic!("unexpected reply {}", other),
    }
}

#[tokio::test]
async fn test_storage_file_holds_flushed_entries() {
    let mut cluster = TestCluster::start().await;
    let node = cluster.add_node().await;
    put_at(&node, "alpha", "one").await;
    put_at(&node, "beta", "two words").await;

    assert_eq!(node.sync_cache_to_storage().await.unwrap(), 2);
    let path = cluster
        .dir
        .path()
        .join(format!("127.0.0.1_{}.txt", node.port()));
    let contents = std::fs::read_to_string(path).unwrap();
    assert!(contents.lines().any(|line| line == "alpha one"));
    assert!(contents.lines().any(|line| line == "beta two words"));
    assert_eq!(get_at(&node, "beta").await.value(), Some("two words"));
}

#[tokio::test]
async fn test_malformed_lines_get_failed_reply() {
    let mut cluster = TestCluster::start().await;
    let node = cluster.add_node().await;

    let client = ring_kv_core::KvClient::new(node.name());
    let reply = client
        .request_at(node.name(), &ring_kv_core::protocol::ClientRequest::get("a"))
        .await
        .unwrap();
    assert!(matches!(reply, ClientResponse::GetError { .. }));

    let transport = TcpTransport::new();
    let request = EcsMessage::new(EcsAction::NewNode);
    let reply = send_ecs(&transport, node.name(), request, Duration::from_secs(2)).await.unwrap();
    assert!(!reply.success);
}
