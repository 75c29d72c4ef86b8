//! In-process cluster harness: one coordinator and any number of storage
//! nodes on ephemeral localhost ports, each node with its own storage file
//! under a shared temp directory.

#![allow(dead_code)]

use ring_kv_core::protocol::{ClientRequest, ClientResponse};
use ring_kv_core::{
    Coordinator, CoordinatorHandle, HashRing, KvClient, PeerTransport, Result, RingConfig,
    StorageNode, TcpTransport,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub struct TestCluster {
    pub dir: TempDir,
    pub config: RingConfig,
    pub coordinator: Option<CoordinatorHandle>,
    pub nodes: Vec<Arc<StorageNode>>,
}

pub fn base_config(dir: &TempDir) -> RingConfig {
    let mut config = RingConfig::default();
    config.node.host = "127.0.0.1".to_string();
    config.node.storage_dir = dir.path().display().to_string();
    config.coordinator.host = "127.0.0.1".to_string();
    config.coordinator.heartbeat_interval_ms = 200;
    config.coordinator.missed_heartbeats = 2;
    config.cache.capacity = 3;
    config.election.coordinator_timeout_ms = 60_000;
    config.election.reregister_attempts = 3;
    config.election.reregister_backoff_ms = 100;
    config.network.rpc_timeout_ms = 2_000;
    config.network.control_timeout_ms = 10_000;
    config
}

impl TestCluster {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut RingConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(&dir);
        tweak(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        config.coordinator.port = listener.local_addr().unwrap().port();
        let handle = CoordinatorHandle::start(
            config.clone(),
            Arc::new(TcpTransport::new()),
            HashRing::new(),
            listener,
        );

        Self {
            dir,
            config,
            coordinator: Some(handle),
            nodes: Vec::new(),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        self.coordinator
            .as_ref()
            .expect("coordinator stopped")
            .coordinator()
    }

    pub fn stop_coordinator(&mut self) {
        if let Some(handle) = self.coordinator.take() {
            handle.stop();
        }
    }

    pub async fn add_node(&mut self) -> Arc<StorageNode> {
        self.try_add_node(self.config.clone(), Arc::new(TcpTransport::new()))
            .await
            .unwrap()
    }

    pub async fn try_add_node(
        &mut self,
        config: RingConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<StorageNode>> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        self.start_node(config, transport, listener).await
    }

    /// Start a node on a listener the test bound itself, so the node's id
    /// is known before it joins.
    pub async fn start_node(
        &mut self,
        config: RingConfig,
        transport: Arc<dyn PeerTransport>,
        listener: TcpListener,
    ) -> Result<Arc<StorageNode>> {
        let node = StorageNode::start(config, listener, transport).await?;
        self.nodes.push(Arc::clone(&node));
        Ok(node)
    }

    pub fn client(&self) -> KvClient {
        KvClient::new(self.nodes[0].name()).with_timeout(Duration::from_secs(5))
    }

    pub fn node_named(&self, name: &str) -> &Arc<StorageNode> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .unwrap_or_else(|| panic!("no node named {}", name))
    }
}

pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Every node's range starts at its predecessor's id and ends at its own.
pub fn assert_partitioned(ring: &HashRing) {
    if ring.size() == 1 {
        let only = ring.nodes().next().unwrap();
        assert!(only.range.is_full(), "single node must own the full ring");
        return;
    }
    for node in ring.nodes() {
        let predecessor = ring.predecessor(&node.id).unwrap();
        assert_eq!(node.range.low, predecessor.id, "gap or overlap before {}", node.name());
        assert_eq!(node.range.high, node.id);
    }
}

pub async fn get_at(node: &StorageNode, key: &str) -> ClientResponse {
    KvClient::new(node.name())
        .request_at(node.name(), &ClientRequest::get(key))
        .await
        .unwrap()
}

pub async fn put_at(node: &StorageNode, key: &str, value: &str) -> ClientResponse {
    KvClient::new(node.name())
        .request_at(node.name(), &ClientRequest::put(key, value))
        .await
        .unwrap()
}

/// Every node in `nodes` has applied a ring of `size` members.
pub async fn rings_settled(nodes: &[Arc<StorageNode>], size: usize) -> bool {
    for node in nodes {
        match node.metadata().await {
            Some(ring) if ring.size() == size => {}
            _ => return false,
        }
    }
    true
}

/// True once each node's successors hold a replica copy of all of its
/// primary entries.
pub async fn replicas_converged(nodes: &[Arc<StorageNode>]) -> bool {
    for node in nodes {
        let Some(ring) = node.metadata().await else {
            return false;
        };
        let Some(me) = ring.get(&node.id()) else {
            continue;
        };
        let Ok(primary) = node.primary_entries().await else {
            return false;
        };
        for successor in me.successors.iter().take(node.config().replication.fan_out) {
            let Some(target) = nodes.iter().find(|n| n.name() == successor) else {
                return false;
            };
            if target.replica_count(&node.id()).await != primary.len() {
                return false;
            }
            for (key, value) in &primary {
                if target.replica_value(&node.id(), key).await.as_deref() != Some(value.as_str()) {
                    return false;
                }
            }
        }
    }
    true
}
