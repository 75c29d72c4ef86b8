//! Coordinator failover.
//!
//! Each node tracks when it last heard from the coordinator. After
//! `coordinator_timeout` of silence it checks whether the coordinator is
//! really gone, then asks every reachable node of higher priority. If none
//! answers, this node binds the rendezvous address and coordinates from its
//! last ring snapshot; otherwise it waits for the winner and re-registers.
//!
//! Nodes only decide from what they can reach, so a network partition can
//! produce two coordinators. Nothing here prevents that.

use crate::coordinator::CoordinatorHandle;
use crate::error::{KvError, Result};
use crate::hash::KeyHash;
use crate::log::log_cluster_operation;
use crate::metrics::MetricsCollector;
use crate::node::{NodeStatus, StorageNode};
use crate::protocol::{EcsAction, EcsMessage};
use crate::ring::{HashRing, NodeDescriptor};
use crate::shutdown::ShutdownListener;
use crate::transport::send_ecs;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub(crate) fn spawn_monitor(node: Arc<StorageNode>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(node.config().heartbeat_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !should_watch(&node).await {
                        continue;
                    }
                    if node.coordinator_silence() >= node.config().coordinator_timeout() {
                        warn!(
                            "{} has not heard from the coordinator for {:?}",
                            node.name(),
                            node.coordinator_silence()
                        );
                        if let Err(e) = recover(&node).await {
                            warn!("Coordinator recovery on {} failed: {}", node.name(), e);
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

async fn should_watch(node: &StorageNode) -> bool {
    if node.is_acting_coordinator().await {
        return false;
    }
    matches!(node.status().await, NodeStatus::Active | NodeStatus::WriteLocked)
}

/// Ring members that outrank `own`, highest priority first.
pub fn higher_priority_candidates(ring: &HashRing, own: &KeyHash) -> Vec<NodeDescriptor> {
    let own_rank = ring.get(own).map(|me| (me.priority, me.id));
    let mut candidates: Vec<NodeDescriptor> = ring
        .nodes()
        .filter(|node| node.id != *own)
        .filter(|node| match own_rank {
            Some(rank) => (node.priority, node.id) > rank,
            None => true,
        })
        .cloned()
        .collect();
    candidates.sort_by(|a, b| (b.priority, b.id).cmp(&(a.priority, a.id)));
    candidates
}

async fn probe(node: &StorageNode, address: &str) -> bool {
    let message = EcsMessage::new(EcsAction::Heartbeat).with_server_info(node.server_info());
    matches!(
        send_ecs(node.transport(), address, message, node.config().rpc_timeout()).await,
        Ok(reply) if reply.success
    )
}

/// React to a silent coordinator.
pub async fn recover(node: &StorageNode) -> Result<()> {
    let coordinator = node.config().coordinator_address();
    if probe(node, &coordinator).await {
        info!("Coordinator at {} still answers, re-registering", coordinator);
        return node.register().await;
    }

    let snapshot = node
        .metadata()
        .await
        .ok_or_else(|| KvError::Election("no ring snapshot to elect from".into()))?;

    for candidate in higher_priority_candidates(&snapshot, &node.id()) {
        if probe(node, &candidate.name()).await {
            info!(
                "{} (priority {}) outranks {}, waiting for it to take over",
                candidate.name(),
                candidate.priority,
                node.name()
            );
            tokio::time::sleep(node.config().reregister_backoff()).await;
            return node.register().await;
        }
    }

    take_over(node, snapshot).await
}

/// Become the coordinator. Unreachable members are dropped from the ring
/// and this node hands its own data to its successor, unless it is the
/// last member.
async fn take_over(node: &StorageNode, snapshot: HashRing) -> Result<()> {
    let started = Instant::now();
    info!("{} taking over as coordinator", node.name());

    let handle = CoordinatorHandle::bind(node.config().clone(), node.transport_handle(), snapshot)
        .await
        .map_err(|e| KvError::Election(format!("cannot bind rendezvous address: {}", e)))?;
    let coordinator = Arc::clone(handle.coordinator());
    node.set_acting_coordinator(handle).await;
    MetricsCollector::incr(&node.metrics().elections_won);

    for member in coordinator.ring_snapshot().await.nodes() {
        if member.id == node.id() || probe(node, &member.name()).await {
            continue;
        }
        if let Err(e) = coordinator.on_heartbeat_missed(member.id).await {
            warn!("Could not drop {} from the ring: {}", member.name(), e);
        }
    }

    let ring = coordinator.ring_snapshot().await;
    if ring.size() > 1 && ring.contains(&node.id()) {
        match coordinator.leave(node.id()).await {
            Ok(()) => node.mark_terminated().await,
            Err(e) => warn!("{} kept its data, handing off failed: {}", node.name(), e),
        }
    } else {
        coordinator.update_all_nodes_metadata().await;
    }

    log_cluster_operation("election", node.name(), true, started.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with_priorities(priorities: &[(u16, u32)]) -> HashRing {
        let mut ring = HashRing::new();
        for (port, priority) in priorities {
            let mut node = NodeDescriptor::new("127.0.0.1", *port);
            node.priority = *priority;
            ring.put(node);
        }
        ring
    }

    #[test]
    fn test_candidates_sorted_by_priority() {
        let ring = ring_with_priorities(&[(5001, 1500), (5002, 9000), (5003, 4000), (5004, 3000)]);
        let own = KeyHash::of("127.0.0.1:5004");

        let names: Vec<String> = higher_priority_candidates(&ring, &own)
            .iter()
            .map(|n| n.name())
            .collect();
        assert_eq!(names, vec!["127.0.0.1:5002", "127.0.0.1:5003"]);
    }

    #[test]
    fn test_highest_priority_has_no_candidates() {
        let ring = ring_with_priorities(&[(5001, 1500), (5002, 9000)]);
        assert!(higher_priority_candidates(&ring, &KeyHash::of("127.0.0.1:5002")).is_empty());
    }

    #[test]
    fn test_unknown_node_defers_to_everyone() {
        let ring = ring_with_priorities(&[(5001, 1500), (5002, 9000)]);
        let candidates = higher_priority_candidates(&ring, &KeyHash::of("127.0.0.1:5999"));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].priority, 9000);
    }
}
