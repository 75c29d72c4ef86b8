//! Replication to ring successors.
//!
//! Every successful write on a node is queued and pushed, in order, to its
//! first `fan_out` successors as a `CoordMessage`. Replicas keep the copies
//! apart per sending node so a node can tell whose data it holds.

use crate::hash::KeyHash;
use crate::log::log_replication_push;
use crate::node::StorageNode;
use crate::protocol::{CoordAction, CoordMessage};
use crate::ring::HashRing;
use crate::shutdown::ShutdownListener;
use crate::transport::send_coord;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Replica copies held on behalf of predecessors, keyed by sender id.
#[derive(Debug, Default, Clone)]
pub struct ReplicaStore {
    by_sender: HashMap<KeyHash, HashMap<String, String>>,
}

impl ReplicaStore {
    /// Apply one replication message. Returns false if it is malformed.
    pub fn apply(&mut self, message: &CoordMessage) -> bool {
        match message.action {
            CoordAction::Put | CoordAction::Update => match (&message.key, &message.value) {
                (Some(key), Some(value)) => {
                    self.by_sender
                        .entry(message.sender)
                        .or_default()
                        .insert(key.clone(), value.clone());
                    true
                }
                _ => false,
            },
            CoordAction::Delete => match &message.key {
                Some(key) => {
                    if let Some(entries) = self.by_sender.get_mut(&message.sender) {
                        entries.remove(key);
                    }
                    true
                }
                None => false,
            },
            CoordAction::ForceSync => {
                self.by_sender
                    .insert(message.sender, message.data.iter().cloned().collect());
                true
            }
        }
    }

    /// The copy sent by the node `ring` says owns `key`. Other senders may
    /// still hold a stale copy from before the range moved.
    pub fn get_owned(&self, ring: &HashRing, key: &str) -> Option<&String> {
        let owner = ring.responsible_for_key(key)?;
        self.get_from(&owner.id, key)
    }

    pub fn get_from(&self, sender: &KeyHash, key: &str) -> Option<&String> {
        self.by_sender.get(sender)?.get(key)
    }

    pub fn len_for(&self, sender: &KeyHash) -> usize {
        self.by_sender.get(sender).map(HashMap::len).unwrap_or(0)
    }

    pub fn senders(&self) -> Vec<KeyHash> {
        self.by_sender.keys().copied().collect()
    }

    pub fn take(&mut self, sender: &KeyHash) -> Option<HashMap<String, String>> {
        self.by_sender.remove(sender)
    }

    pub fn is_empty(&self) -> bool {
        self.by_sender.values().all(HashMap::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationTask {
    Mutation {
        action: CoordAction,
        key: String,
        value: Option<String>,
    },
    /// Push the full primary data set, replacing what replicas hold.
    ForceSync,
}

/// Sending half of a node's replication queue. Disabled replication keeps
/// no channel at all and drops every task.
#[derive(Debug, Clone)]
pub struct ReplicationHandle {
    tx: Option<mpsc::UnboundedSender<ReplicationTask>>,
}

impl ReplicationHandle {
    pub fn channel(enabled: bool) -> (Self, mpsc::UnboundedReceiver<ReplicationTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = if enabled { Some(tx) } else { None };
        (Self { tx }, rx)
    }

    pub fn replicate(&self, action: CoordAction, key: &str, value: Option<&str>) {
        self.enqueue(ReplicationTask::Mutation {
            action,
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }

    pub fn force_sync(&self) {
        self.enqueue(ReplicationTask::ForceSync);
    }

    fn enqueue(&self, task: ReplicationTask) {
        if let Some(tx) = &self.tx {
            if tx.send(task).is_err() {
                debug!("Replication worker gone, dropping task");
            }
        }
    }
}

/// Drain the queue one task at a time so replicas see writes in order.
pub(crate) async fn run_worker(
    node: Arc<StorageNode>,
    mut queue: mpsc::UnboundedReceiver<ReplicationTask>,
    mut shutdown: ShutdownListener,
) {
    loop {
        tokio::select! {
            task = queue.recv() => match task {
                Some(task) => push(&node, task).await,
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!("Replication worker for {} stopped", node.name());
}

async fn push(node: &StorageNode, task: ReplicationTask) {
    let targets = node.replica_targets().await;
    if targets.is_empty() {
        return;
    }

    let message = match task {
        ReplicationTask::Mutation { action, key, value } => {
            CoordMessage::mutation(action, node.id(), key, value)
        }
        ReplicationTask::ForceSync => match node.primary_entries().await {
            Ok(data) => CoordMessage::force_sync(node.id(), data),
            Err(e) => {
                error!("Cannot read primary data for FORCE_SYNC: {}", e);
                return;
            }
        },
    };
    let action = message.action.to_string();
    let limit = node.config().rpc_timeout();

    let sends = targets.iter().map(|target| {
        let message = message.clone();
        async move {
            let started = Instant::now();
            let outcome = send_coord(node.transport(), target, message, limit).await;
            (target, outcome, started.elapsed())
        }
    });

    for (target, outcome, elapsed) in join_all(sends).await {
        let success = match outcome {
            Ok(reply) => reply.is_success,
            Err(e) => {
                debug!("Replication to {} failed: {}", target, e);
                false
            }
        };
        log_replication_push(&action, target, success, elapsed);
        node.metrics().record_replication(success);
    }
}

/// Periodically re-push the full data set to the current successors.
pub(crate) fn spawn_periodic_sync(
    handle: ReplicationHandle,
    period: Duration,
    mut shutdown: ShutdownListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => handle.force_sync(),
                _ = shutdown.recv() => break,
            }
        }
    })
}
