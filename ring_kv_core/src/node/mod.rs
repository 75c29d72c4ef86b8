//! Storage node runtime.
//!
//! One `StorageNode` per process: it serves client lines and peer JSON on a
//! single listener, registers with the coordinator, pushes writes to its
//! replicas and watches the coordinator for failover.

mod control;
mod state;
mod requests;
mod server;

pub use self::state::{NodeCore, PutOutcome};
pub use self::server::serve;

use crate::cache::build_cache;
use crate::config::RingConfig;
use crate::coordinator::CoordinatorHandle;
use crate::election;
use crate::error::{KvError, Result};
use crate::hash::KeyHash;
use crate::log::{log_cluster_operation, log_startup};
use crate::metrics::MetricsCollector;
use crate::protocol::{EcsAction, EcsMessage, Registration, ServerInfo};
use crate::replication::{self, ReplicationHandle};
use crate::ring::{node_name, HashRing};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::storage::FileStorage;
use crate::transport::{send_ecs, PeerTransport};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unregistered,
    Registering,
    Active,
    WriteLocked,
    Leaving,
    Terminated,
}

impl NodeStatus {
    pub fn serves_clients(&self) -> bool {
        matches!(
            self,
            NodeStatus::Active | NodeStatus::WriteLocked | NodeStatus::Leaving
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Unregistered => "unregistered",
            NodeStatus::Registering => "registering",
            NodeStatus::Active => "active",
            NodeStatus::WriteLocked => "write-locked",
            NodeStatus::Leaving => "leaving",
            NodeStatus::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

pub struct StorageNode {
    config: RingConfig,
    host: String,
    port: u16,
    id: KeyHash,
    name: String,
    core: Mutex<NodeCore>,
    transport: Arc<dyn PeerTransport>,
    replication: ReplicationHandle,
    last_contact: std::sync::Mutex<Instant>,
    acting_coordinator: Mutex<Option<CoordinatorHandle>>,
    metrics: Arc<MetricsCollector>,
    shutdown: Shutdown,
}

impl StorageNode {
    /// Bind the configured node address, then `start`.
    pub async fn bind(config: RingConfig, transport: Arc<dyn PeerTransport>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.node_address()).await?;
        Self::start(config, listener, transport).await
    }

    /// Serve on `listener` and register with the coordinator. The port the
    /// listener is bound to becomes part of the node's identity.
    pub async fn start(
        config: RingConfig,
        listener: TcpListener,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>> {
        let local: SocketAddr = listener.local_addr()?;
        let host = config.node.host.clone();
        let port = local.port();
        let name = node_name(&host, port);
        let id = KeyHash::of(&name);

        let storage = FileStorage::open(&config.node.storage_dir, &host, port).await?;
        let cache = build_cache(config.cache.strategy, config.cache.capacity);
        let metrics = Arc::new(MetricsCollector::new());
        let (replicator, queue) = ReplicationHandle::channel(config.replication.enabled);
        let shutdown = Shutdown::new();

        let node = Arc::new(Self {
            core: Mutex::new(NodeCore::new(cache, storage, Arc::clone(&metrics))),
            config,
            host,
            port,
            id,
            name,
            transport,
            replication: replicator.clone(),
            last_contact: std::sync::Mutex::new(Instant::now()),
            acting_coordinator: Mutex::new(None),
            metrics,
            shutdown,
        });
        log_startup("storage node", &node.name);

        let server = Arc::clone(&node);
        let listener_shutdown = node.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve(server, listener, listener_shutdown).await {
                tracing::error!("Node listener failed: {}", e);
            }
        });
        tokio::spawn(replication::run_worker(
            Arc::clone(&node),
            queue,
            node.shutdown.subscribe(),
        ));
        if let Some(period) = node.config.force_sync_interval() {
            replication::spawn_periodic_sync(replicator, period, node.shutdown.subscribe());
        }

        if let Err(e) = node.register().await {
            node.shutdown.trigger(ShutdownSignal::Manual);
            return Err(e);
        }
        election::spawn_monitor(Arc::clone(&node), node.shutdown.subscribe());
        Ok(node)
    }

    pub fn id(&self) -> KeyHash {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo::new(self.host.clone(), self.port)
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub(crate) fn transport(&self) -> &dyn PeerTransport {
        self.transport.as_ref()
    }

    pub(crate) fn transport_handle(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn status(&self) -> NodeStatus {
        let core = self.core.lock().await;
        if core.write_lock && core.lifecycle == NodeStatus::Active {
            NodeStatus::WriteLocked
        } else {
            core.lifecycle
        }
    }

    pub async fn metadata(&self) -> Option<HashRing> {
        self.core.lock().await.metadata.clone()
    }

    /// Number of replica entries held for `sender`.
    pub async fn replica_count(&self, sender: &KeyHash) -> usize {
        self.core.lock().await.replicas.len_for(sender)
    }

    pub async fn replica_value(&self, sender: &KeyHash, key: &str) -> Option<String> {
        self.core.lock().await.replicas.get_from(sender, key).cloned()
    }

    /// Every primary entry, cached or stored.
    pub async fn primary_entries(&self) -> Result<Vec<(String, String)>> {
        self.core.lock().await.all_entries().await
    }

    pub(crate) async fn replica_targets(&self) -> Vec<String> {
        let core = self.core.lock().await;
        match core.descriptor(&self.id) {
            Some(me) => me
                .successors
                .iter()
                .take(self.config.replication.fan_out)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn touch_coordinator(&self) {
        let mut last = self
            .last_contact
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    pub(crate) fn coordinator_silence(&self) -> Duration {
        self.last_contact
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    pub async fn is_acting_coordinator(&self) -> bool {
        self.acting_coordinator.lock().await.is_some()
    }

    pub(crate) async fn set_acting_coordinator(&self, handle: CoordinatorHandle) {
        *self.acting_coordinator.lock().await = Some(handle);
    }

    pub(crate) async fn mark_terminated(&self) {
        self.core.lock().await.lifecycle = NodeStatus::Terminated;
    }

    /// Register with the coordinator, retrying with backoff. A node that
    /// is already a ring member stays active while it re-registers.
    pub async fn register(&self) -> Result<()> {
        {
            let mut core = self.core.lock().await;
            if core.lifecycle == NodeStatus::Unregistered {
                core.lifecycle = NodeStatus::Registering;
            }
        }

        let attempts = self.config.election.reregister_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let started = Instant::now();
            match self.send_registration().await {
                Ok(()) => {
                    self.touch_coordinator();
                    log_cluster_operation("register", &self.name, true, started.elapsed());
                    return Ok(());
                }
                Err(e) => {
                    warn!("Registration attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reregister_backoff()).await;
                    }
                }
            }
        }

        let mut core = self.core.lock().await;
        if core.lifecycle == NodeStatus::Registering {
            core.lifecycle = NodeStatus::Unregistered;
        }
        Err(last_error.unwrap_or_else(|| KvError::Internal("registration never attempted".into())))
    }

    async fn send_registration(&self) -> Result<()> {
        let storage_path = {
            let core = self.core.lock().await;
            core.storage.path().display().to_string()
        };
        let message = EcsMessage::new(EcsAction::NewNode)
            .with_server_info(self.server_info())
            .with_registration(Registration {
                cache_strategy: self.config.cache.strategy,
                cache_size: self.config.cache.capacity,
                storage_path,
            });

        let reply = send_ecs(
            self.transport(),
            &self.config.coordinator_address(),
            message,
            self.config.control_timeout(),
        )
        .await?;
        if !reply.success {
            return Err(KvError::Protocol(format!(
                "registration refused: {}",
                reply.error_text()
            )));
        }
        if let Some(ring) = reply.nodes {
            self.apply_metadata(ring).await?;
        }
        Ok(())
    }

    /// Install a new ring view. Becoming a member activates the node and
    /// replicas of departed nodes are adopted. A change of range or
    /// successors re-syncs the replicas in full.
    pub(crate) async fn apply_metadata(&self, ring: HashRing) -> Result<()> {
        let mut core = self.core.lock().await;
        let (previous_range, previous_successors) = match core.descriptor(&self.id) {
            Some(me) => (Some(me.range), me.successors.clone()),
            None => (None, Vec::new()),
        };
        let me = ring.get(&self.id).cloned();
        core.metadata = Some(ring);

        let Some(me) = me else {
            return Ok(());
        };
        if matches!(
            core.lifecycle,
            NodeStatus::Unregistered | NodeStatus::Registering
        ) {
            core.lifecycle = NodeStatus::Active;
            info!("{} is now serving range {:?}", self.name, me.range);
        }
        core.promote_orphaned_replicas(me.range).await?;

        // A shrunk range leaves moved keys in the replicas' copy of ours.
        if me.successors != previous_successors || previous_range != Some(me.range) {
            self.replication.force_sync();
        }
        Ok(())
    }

    /// Move every cached entry to the storage file.
    pub async fn sync_cache_to_storage(&self) -> Result<usize> {
        self.core.lock().await.flush_cache().await
    }

    /// Leave the ring gracefully. The node ends up terminated even if the
    /// coordinator could not be reached.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut core = self.core.lock().await;
            if core.lifecycle != NodeStatus::Active {
                return Ok(());
            }
            core.lifecycle = NodeStatus::Leaving;
            let flushed = core.flush_cache().await?;
            info!("{} leaving the ring, flushed {} cached entries", self.name, flushed);
        }

        let started = Instant::now();
        let message = EcsMessage::new(EcsAction::Delete).with_server_info(self.server_info());
        let outcome = send_ecs(
            self.transport(),
            &self.config.coordinator_address(),
            message,
            self.config.control_timeout(),
        )
        .await;
        let result = match outcome {
            Ok(reply) if reply.success => Ok(()),
            Ok(reply) => Err(KvError::Protocol(reply.error_text().to_string())),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!("Leave was not acknowledged: {}", e);
        }
        log_cluster_operation("leave", &self.name, result.is_ok(), started.elapsed());

        self.mark_terminated().await;
        result
    }

    /// Stop serving without telling anyone, as a crash would.
    pub async fn halt(&self) {
        if let Some(handle) = self.acting_coordinator.lock().await.take() {
            handle.stop();
        }
        self.shutdown.trigger(ShutdownSignal::Manual);
    }

    /// Graceful stop: leave the ring, then halt.
    pub async fn shutdown(&self) -> Result<()> {
        let result = if self.is_acting_coordinator().await {
            self.sync_cache_to_storage().await.map(|_| ())
        } else {
            self.leave().await
        };
        self.halt().await;
        result
    }
}
