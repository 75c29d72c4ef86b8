//! Control messages from the coordinator and replication messages from
//! predecessors.

use super::{NodeCore, NodeStatus, StorageNode};
use crate::protocol::{CoordMessage, EcsAction, EcsMessage, PeerMessage};
use crate::transport::send_ecs;
use tracing::{debug, info, warn};

/// Refusal for migration steps that need the write lock.
fn require_lock(core: &NodeCore, action: EcsAction) -> Option<EcsMessage> {
    if core.write_lock {
        None
    } else {
        Some(EcsMessage::failed(action, "write lock not set"))
    }
}

impl StorageNode {
    pub async fn handle_peer(&self, message: PeerMessage) -> PeerMessage {
        match message {
            PeerMessage::Ecs(message) => PeerMessage::Ecs(self.handle_ecs(message).await),
            PeerMessage::Coord(message) => PeerMessage::Coord(self.handle_coord(message).await),
        }
    }

    pub async fn handle_ecs(&self, message: EcsMessage) -> EcsMessage {
        let action = message.action;
        // Peer probes carry the prober's identity; APPEND comes from the
        // migration source. Everything else is the coordinator talking.
        let from_peer = match action {
            EcsAction::Heartbeat => message.server_info.is_some(),
            EcsAction::Append => true,
            _ => false,
        };
        if !from_peer {
            self.touch_coordinator();
        }
        debug!("{} received {}", self.name, action);

        match action {
            EcsAction::Heartbeat => EcsMessage::ok(action),
            EcsAction::SetWriteLock => {
                let mut core = self.core.lock().await;
                if core.write_lock {
                    EcsMessage::failed(action, "write lock already set")
                } else {
                    core.write_lock = true;
                    EcsMessage::ok(action)
                }
            }
            EcsAction::UnsetWriteLock => {
                let mut core = self.core.lock().await;
                if let Some(refusal) = require_lock(&core, action) {
                    return refusal;
                }
                core.write_lock = false;
                EcsMessage::ok(action)
            }
            EcsAction::Transfer => self.transfer(message).await,
            EcsAction::Append => {
                let mut core = self.core.lock().await;
                if let Some(refusal) = require_lock(&core, action) {
                    return refusal;
                }
                match core.upsert(&message.data).await {
                    Ok(()) => {
                        info!("{} appended {} migrated entries", self.name, message.data.len());
                        EcsMessage::ok(action)
                    }
                    Err(e) => EcsMessage::failed(action, e.to_string()),
                }
            }
            EcsAction::Remove => {
                let Some(range) = message.range else {
                    return EcsMessage::failed(action, "REMOVE needs a range");
                };
                let mut core = self.core.lock().await;
                if let Some(refusal) = require_lock(&core, action) {
                    return refusal;
                }
                match core.remove_range(&range).await {
                    Ok(removed) => {
                        info!("{} removed {} entries in {:?}", self.name, removed, range);
                        EcsMessage::ok(action)
                    }
                    Err(e) => EcsMessage::failed(action, e.to_string()),
                }
            }
            EcsAction::UpdateMetadata => {
                let Some(ring) = message.nodes else {
                    return EcsMessage::failed(action, "UPDATE_METADATA needs a ring");
                };
                match self.apply_metadata(ring).await {
                    Ok(()) => EcsMessage::ok(action),
                    Err(e) => {
                        warn!("{} could not apply metadata: {}", self.name, e);
                        EcsMessage::failed(action, e.to_string())
                    }
                }
            }
            EcsAction::Delete => {
                self.core.lock().await.lifecycle = NodeStatus::Terminated;
                info!("{} terminated by the coordinator", self.name);
                EcsMessage::ok(action)
            }
            EcsAction::NewNode => {
                EcsMessage::failed(action, "storage nodes do not accept registrations")
            }
        }
    }

    /// Ship the entries of a range to the destination with APPEND. The
    /// source keeps its copy until the coordinator sends REMOVE.
    async fn transfer(&self, message: EcsMessage) -> EcsMessage {
        let action = EcsAction::Transfer;
        let (Some(range), Some(destination)) = (message.range, message.server_info) else {
            return EcsMessage::failed(action, "TRANSFER needs a range and a destination");
        };

        let entries = {
            let core = self.core.lock().await;
            if let Some(refusal) = require_lock(&core, action) {
                return refusal;
            }
            match core.entries_in_range(&range).await {
                Ok(entries) => entries,
                Err(e) => return EcsMessage::failed(action, e.to_string()),
            }
        };
        let count = entries.len();

        let append = EcsMessage::new(EcsAction::Append)
            .with_range(range)
            .with_data(entries);
        let target = destination.name();
        match send_ecs(self.transport(), &target, append, self.config.rpc_timeout()).await {
            Ok(reply) if reply.success => {
                info!("{} transferred {} entries to {}", self.name, count, target);
                EcsMessage::ok(action)
            }
            Ok(reply) => EcsMessage::failed(
                action,
                format!("{} refused APPEND: {}", target, reply.error_text()),
            ),
            Err(e) => EcsMessage::failed(action, format!("APPEND to {} failed: {}", target, e)),
        }
    }

    pub async fn handle_coord(&self, message: CoordMessage) -> CoordMessage {
        let applied = self.core.lock().await.replicas.apply(&message);
        if !applied {
            warn!("{} ignored malformed {} from {}", self.name, message.action, message.sender);
        }
        message.reply(applied)
    }
}
