//! Two-phase, write-locked handoff of a hash range between two nodes.
//!
//! 1. lock destination, then source
//! 2. source pushes `(low, high]` to destination (`TRANSFER` -> `APPEND`)
//! 3. unlock destination, `REMOVE` on source, unlock source
//!
//! A failed lock in step 1 releases the destination again. Any later failure
//! leaves both locks set and the caller must not touch the ring.

use crate::error::{KvError, Result};
use crate::hash::HashRange;
use crate::log::log_migration_step;
use crate::protocol::{EcsAction, EcsMessage, ServerInfo};
use crate::transport::{send_ecs, PeerTransport};
use std::time::{Duration, Instant};

pub struct Migration<'a> {
    transport: &'a dyn PeerTransport,
    source: ServerInfo,
    destination: ServerInfo,
    range: HashRange,
    rpc_timeout: Duration,
}

impl<'a> Migration<'a> {
    pub fn new(
        transport: &'a dyn PeerTransport,
        source: ServerInfo,
        destination: ServerInfo,
        range: HashRange,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            source,
            destination,
            range,
            rpc_timeout,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let source = self.source.name();
        let destination = self.destination.name();
        tracing::info!(
            "Migrating {:?} from {} to {}",
            self.range,
            source,
            destination
        );

        self.step(&destination, EcsMessage::new(EcsAction::SetWriteLock))
            .await?;
        if let Err(e) = self
            .step(&source, EcsMessage::new(EcsAction::SetWriteLock))
            .await
        {
            self.release(&destination).await;
            return Err(e);
        }

        // TRANSFER waits on the source's own APPEND round trip.
        let transfer = EcsMessage::new(EcsAction::Transfer)
            .with_range(self.range)
            .with_server_info(self.destination.clone());
        self.step_with_timeout(&source, transfer, self.rpc_timeout * 2)
            .await?;

        self.step(&destination, EcsMessage::new(EcsAction::UnsetWriteLock))
            .await?;
        self.step(&source, EcsMessage::new(EcsAction::Remove).with_range(self.range))
            .await?;
        self.step(&source, EcsMessage::new(EcsAction::UnsetWriteLock))
            .await?;
        Ok(())
    }

    async fn step(&self, address: &str, message: EcsMessage) -> Result<()> {
        self.step_with_timeout(address, message, self.rpc_timeout)
            .await
    }

    async fn step_with_timeout(
        &self,
        address: &str,
        message: EcsMessage,
        limit: Duration,
    ) -> Result<()> {
        let action = message.action;
        let started = Instant::now();
        let outcome = send_ecs(self.transport, address, message, limit).await;
        let success = matches!(&outcome, Ok(reply) if reply.success);
        log_migration_step(&action.to_string(), address, success, started.elapsed());

        match outcome {
            Ok(reply) if reply.success => Ok(()),
            Ok(reply) => Err(KvError::Migration(format!(
                "{} refused by {}: {}",
                action,
                address,
                reply.error_text()
            ))),
            Err(e) => Err(KvError::Migration(format!(
                "{} to {} failed: {}",
                action, address, e
            ))),
        }
    }

    async fn release(&self, address: &str) {
        if let Err(e) = self
            .step(address, EcsMessage::new(EcsAction::UnsetWriteLock))
            .await
        {
            tracing::warn!("Could not release write lock on {}: {}", address, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::KeyHash;
    use crate::protocol::PeerMessage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call and refuses one chosen (address, action) pair.
    struct ScriptedTransport {
        calls: Mutex<Vec<(String, EcsAction)>>,
        refuse: Option<(String, EcsAction)>,
    }

    impl ScriptedTransport {
        fn new(refuse: Option<(&str, EcsAction)>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                refuse: refuse.map(|(a, act)| (a.to_string(), act)),
            }
        }

        fn calls(&self) -> Vec<(String, EcsAction)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn request(
            &self,
            address: &str,
            message: PeerMessage,
            _timeout: Duration,
        ) -> Result<PeerMessage> {
            let action = match message {
                PeerMessage::Ecs(m) => m.action,
                PeerMessage::Coord(_) => panic!("migration never replicates"),
            };
            self.calls
                .lock()
                .unwrap()
                .push((address.to_string(), action));
            let refused = self
                .refuse
                .as_ref()
                .map(|(a, act)| a == address && *act == action)
                .unwrap_or(false);
            Ok(PeerMessage::Ecs(if refused {
                EcsMessage::failed(action, "refused")
            } else {
                EcsMessage::ok(action)
            }))
        }
    }

    fn range() -> HashRange {
        HashRange::new(KeyHash::from_u128(1), KeyHash::from_u128(100))
    }

    const SRC: &str = "127.0.0.1:5000";
    const DST: &str = "127.0.0.1:5001";

    fn migration(transport: &ScriptedTransport) -> Migration<'_> {
        Migration::new(
            transport,
            ServerInfo::new("127.0.0.1", 5000),
            ServerInfo::new("127.0.0.1", 5001),
            range(),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_step_order() {
        let transport = ScriptedTransport::new(None);
        migration(&transport).run().await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![
                (DST.to_string(), EcsAction::SetWriteLock),
                (SRC.to_string(), EcsAction::SetWriteLock),
                (SRC.to_string(), EcsAction::Transfer),
                (DST.to_string(), EcsAction::UnsetWriteLock),
                (SRC.to_string(), EcsAction::Remove),
                (SRC.to_string(), EcsAction::UnsetWriteLock),
            ]
        );
    }

    #[tokio::test]
    async fn test_source_lock_failure_releases_destination() {
        let transport = ScriptedTransport::new(Some((SRC, EcsAction::SetWriteLock)));
        let err = migration(&transport).run().await.unwrap_err();
        assert!(matches!(err, KvError::Migration(_)));

        assert_eq!(
            transport.calls(),
            vec![
                (DST.to_string(), EcsAction::SetWriteLock),
                (SRC.to_string(), EcsAction::SetWriteLock),
                (DST.to_string(), EcsAction::UnsetWriteLock),
            ]
        );
    }

    #[tokio::test]
    async fn test_transfer_failure_stops_before_remove() {
        let transport = ScriptedTransport::new(Some((SRC, EcsAction::Transfer)));
        assert!(migration(&transport).run().await.is_err());

        let calls = transport.calls();
        assert_eq!(calls.last(), Some(&(SRC.to_string(), EcsAction::Transfer)));
        assert!(!calls.iter().any(|(_, a)| *a == EcsAction::Remove));
        assert!(!calls.iter().any(|(_, a)| *a == EcsAction::UnsetWriteLock));
    }
}
