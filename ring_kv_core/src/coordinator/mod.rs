//! Membership coordinator.
//!
//! Owns the authoritative ring. Join, leave and failure removal all run
//! under one ring lock, so migrations never interleave. After each change
//! the whole ring is pushed to every node with `UPDATE_METADATA`.

pub mod migration;
mod server;

pub use self::migration::Migration;
pub use self::server::{serve, CoordinatorHandle};

use crate::config::RingConfig;
use crate::error::{KvError, Result};
use crate::hash::{HashRange, KeyHash};
use crate::log::log_cluster_operation;
use crate::metrics::MetricsCollector;
use crate::protocol::{EcsAction, EcsMessage, Registration, ServerInfo};
use crate::ring::{HashRing, NodeDescriptor};
use crate::shutdown::ShutdownListener;
use crate::transport::{send_ecs, PeerTransport};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const PRIORITY_RANGE: std::ops::RangeInclusive<u32> = 1000..=9999;

/// Heartbeat bookkeeping for one ring member.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: KeyHash,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub missed: u32,
}

pub struct Coordinator {
    config: RingConfig,
    ring: Mutex<HashRing>,
    roster: RwLock<Vec<Member>>,
    transport: Arc<dyn PeerTransport>,
    metrics: Arc<MetricsCollector>,
}

impl Coordinator {
    pub fn new(config: RingConfig, transport: Arc<dyn PeerTransport>) -> Self {
        Self::with_ring(config, transport, HashRing::new())
    }

    /// Resume from an existing ring, as a node taking over coordination does.
    pub fn with_ring(config: RingConfig, transport: Arc<dyn PeerTransport>, ring: HashRing) -> Self {
        let roster = build_roster(&ring, &[]);
        Self {
            config,
            ring: Mutex::new(ring),
            roster: RwLock::new(roster),
            transport,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    pub async fn ring_snapshot(&self) -> HashRing {
        self.ring.lock().await.clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.roster
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Register a node. A node already on the ring gets its current
    /// descriptor back unchanged.
    pub async fn join(
        &self,
        info: ServerInfo,
        registration: Option<Registration>,
    ) -> Result<NodeDescriptor> {
        let started = Instant::now();
        let mut ring = self.ring.lock().await;
        let id = info.id();

        if let Some(existing) = ring.get(&id) {
            tracing::info!("Node {} re-registered", info.name());
            return Ok(existing.clone());
        }

        let mut node = NodeDescriptor::new(info.host.clone(), info.port);
        if let Some(registration) = registration {
            node.cache_strategy = registration.cache_strategy;
            node.cache_size = registration.cache_size;
            node.storage_path = registration.storage_path;
        }
        node.priority = unique_priority(&ring);

        if ring.is_empty() {
            node.range = HashRange::full(id);
        } else {
            let predecessor = ring
                .predecessor(&id)
                .map(|n| n.id)
                .ok_or_else(|| KvError::Internal("non-empty ring has no predecessor".into()))?;
            let successor = ring
                .successor(&id)
                .cloned()
                .ok_or_else(|| KvError::Internal("non-empty ring has no successor".into()))?;
            let range = HashRange::new(predecessor, id);

            let source = ServerInfo::new(successor.host.clone(), successor.port);
            if let Err(e) = self.migrate(source, info.clone(), range).await {
                log_cluster_operation("join", &info.name(), false, started.elapsed());
                return Err(e);
            }

            node.range = range;
            if let Some(successor) = ring.get_mut(&successor.id) {
                successor.range.low = id;
            }
        }

        ring.put(node);
        self.broadcast_metadata(&mut ring).await;
        log_cluster_operation("join", &info.name(), true, started.elapsed());

        ring.get(&id)
            .cloned()
            .ok_or_else(|| KvError::Internal(format!("{} vanished after join", info.name())))
    }

    /// Remove a node, handing its range and data to its successor. The last
    /// node is simply dropped and its data left where it is.
    pub async fn leave(&self, id: KeyHash) -> Result<()> {
        let started = Instant::now();
        let mut ring = self.ring.lock().await;
        let leaving = ring
            .get(&id)
            .cloned()
            .ok_or_else(|| KvError::NodeNotFound(id.to_string()))?;

        if ring.size() == 1 {
            ring.delete(&id);
            self.sync_roster(&ring);
            log_cluster_operation("leave", &leaving.name(), true, started.elapsed());
            return Ok(());
        }

        let successor = ring
            .successor(&id)
            .cloned()
            .ok_or_else(|| KvError::Internal("non-empty ring has no successor".into()))?;

        let source = ServerInfo::new(leaving.host.clone(), leaving.port);
        let destination = ServerInfo::new(successor.host.clone(), successor.port);
        if let Err(e) = self.migrate(source, destination, leaving.range).await {
            log_cluster_operation("leave", &leaving.name(), false, started.elapsed());
            return Err(e);
        }

        if let Some(successor) = ring.get_mut(&successor.id) {
            successor.range.low = leaving.range.low;
        }
        ring.delete(&id);
        self.broadcast_metadata(&mut ring).await;
        log_cluster_operation("leave", &leaving.name(), true, started.elapsed());
        Ok(())
    }

    /// Drop a silent node without any data handoff.
    pub async fn on_heartbeat_missed(&self, id: KeyHash) -> Result<()> {
        let started = Instant::now();
        let mut ring = self.ring.lock().await;
        let Some(failed) = ring.get(&id).cloned() else {
            return Ok(());
        };

        if ring.size() > 1 {
            if let Some(successor_id) = ring.successor(&id).map(|n| n.id) {
                if let Some(successor) = ring.get_mut(&successor_id) {
                    successor.range.low = failed.range.low;
                }
            }
        }
        ring.delete(&id);
        MetricsCollector::incr(&self.metrics.heartbeats_missed);

        self.broadcast_metadata(&mut ring).await;
        log_cluster_operation("heartbeat_removal", &failed.name(), true, started.elapsed());
        Ok(())
    }

    pub async fn update_all_nodes_metadata(&self) {
        let mut ring = self.ring.lock().await;
        self.broadcast_metadata(&mut ring).await;
    }

    /// Answer one control request from a node.
    pub async fn handle(&self, message: EcsMessage) -> EcsMessage {
        let action = message.action;
        match action {
            EcsAction::NewNode => {
                let Some(info) = message.server_info else {
                    return EcsMessage::failed(action, "NEW_NODE without server info");
                };
                match self.join(info, message.registration).await {
                    Ok(node) => EcsMessage::ok(action)
                        .with_server_info(ServerInfo::new(node.host, node.port))
                        .with_nodes(self.ring_snapshot().await),
                    Err(e) => EcsMessage::failed(action, e.to_string()),
                }
            }
            EcsAction::Delete => {
                let Some(info) = message.server_info else {
                    return EcsMessage::failed(action, "DELETE without server info");
                };
                match self.leave(info.id()).await {
                    Ok(()) => EcsMessage::ok(action),
                    Err(e) => EcsMessage::failed(action, e.to_string()),
                }
            }
            EcsAction::Heartbeat => EcsMessage::ok(action),
            other => EcsMessage::failed(other, format!("{} is not handled by the coordinator", other)),
        }
    }

    /// Ping every member once and drop those over the miss threshold.
    pub async fn heartbeat_round(&self) {
        let members = self.members();
        let limit = self.config.rpc_timeout();
        let transport = self.transport.as_ref();

        let probes = members.iter().map(|member| async move {
            let reply = send_ecs(
                transport,
                &member.address,
                EcsMessage::new(EcsAction::Heartbeat),
                limit,
            )
            .await;
            (member.id, matches!(reply, Ok(r) if r.success))
        });
        let results = join_all(probes).await;

        let threshold = self.config.coordinator.missed_heartbeats;
        let mut failed = Vec::new();
        {
            let mut roster = self
                .roster
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (id, alive) in results {
                let Some(member) = roster.iter_mut().find(|m| m.id == id) else {
                    continue;
                };
                if alive {
                    member.missed = 0;
                    member.last_seen = Utc::now();
                } else {
                    member.missed += 1;
                    tracing::warn!("{} missed heartbeat {}/{}", member.address, member.missed, threshold);
                    if member.missed >= threshold {
                        failed.push(id);
                    }
                }
            }
        }

        for id in failed {
            if let Err(e) = self.on_heartbeat_missed(id).await {
                tracing::error!("Failed to remove silent node {}: {}", id, e);
            }
        }
    }

    pub fn spawn_heartbeat(self: &Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.heartbeat_round().await,
                    _ = shutdown.recv() => {
                        tracing::debug!("Heartbeat loop stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn migrate(&self, source: ServerInfo, destination: ServerInfo, range: HashRange) -> Result<()> {
        MetricsCollector::incr(&self.metrics.migrations_started);
        let migration = Migration::new(
            self.transport.as_ref(),
            source,
            destination,
            range,
            self.config.rpc_timeout(),
        );
        match migration.run().await {
            Ok(()) => {
                MetricsCollector::incr(&self.metrics.migrations_completed);
                Ok(())
            }
            Err(e) => {
                MetricsCollector::incr(&self.metrics.migrations_failed);
                tracing::error!("Migration of {:?} aborted: {}", range, e);
                Err(e)
            }
        }
    }

    async fn broadcast_metadata(&self, ring: &mut HashRing) {
        ring.recompute_neighbours();
        self.sync_roster(ring);

        let snapshot = ring.clone();
        let limit = self.config.rpc_timeout();
        let transport = self.transport.as_ref();
        let sends = ring.nodes().map(|node| {
            let message = EcsMessage::ok(EcsAction::UpdateMetadata).with_nodes(snapshot.clone());
            let address = node.name();
            async move {
                let outcome = send_ecs(transport, &address, message, limit).await;
                (address, outcome)
            }
        });

        for (address, outcome) in join_all(sends).await {
            match outcome {
                Ok(reply) if reply.success => {}
                Ok(reply) => tracing::warn!("{} rejected metadata: {}", address, reply.error_text()),
                Err(e) => tracing::warn!("Metadata update to {} failed: {}", address, e),
            }
        }
    }

    fn sync_roster(&self, ring: &HashRing) {
        let mut roster = self
            .roster
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::mem::take(&mut *roster);
        *roster = build_roster(ring, &previous);
    }
}

/// Members for every ring node, keeping heartbeat state already known.
fn build_roster(ring: &HashRing, previous: &[Member]) -> Vec<Member> {
    ring.nodes()
        .map(|node| {
            previous
                .iter()
                .find(|m| m.id == node.id)
                .cloned()
                .unwrap_or_else(|| Member {
                    id: node.id,
                    address: node.name(),
                    last_seen: Utc::now(),
                    missed: 0,
                })
        })
        .collect()
}

fn unique_priority(ring: &HashRing) -> u32 {
    let taken: Vec<u32> = ring.nodes().map(|n| n.priority).collect();
    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let candidate = rng.gen_range(PRIORITY_RANGE);
        if !taken.contains(&candidate) {
            return candidate;
        }
    }
    PRIORITY_RANGE
        .find(|p| !taken.contains(p))
        .unwrap_or_else(|| taken.iter().copied().max().unwrap_or(0) + 1)
}
