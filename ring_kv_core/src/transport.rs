//! Request/response transport between peers.
//!
//! Every peer call opens a connection, writes one JSON line and waits for one
//! JSON line back, bounded by a timeout. The trait is the seam tests use to
//! inject failures.

use crate::config::DEFAULT_MAX_LINE_BYTES;
use crate::error::{KvError, Result};
use crate::protocol::{CoordMessage, EcsMessage, PeerMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request(
        &self,
        address: &str,
        message: PeerMessage,
        timeout: Duration,
    ) -> Result<PeerMessage>;
}

/// Line codec that refuses lines longer than `max_line_bytes`.
pub fn line_codec(max_line_bytes: usize) -> LinesCodec {
    LinesCodec::new_with_max_length(max_line_bytes)
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    max_line_bytes: usize,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self { max_line_bytes }
    }

    async fn round_trip(&self, address: &str, message: &PeerMessage) -> Result<PeerMessage> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| KvError::Connection(format!("{}: {}", address, e)))?;
        let mut framed = Framed::new(stream, line_codec(self.max_line_bytes));

        framed.send(serde_json::to_string(message)?).await?;
        match framed.next().await {
            Some(Ok(line)) => Ok(serde_json::from_str(&line)?),
            Some(Err(e)) => Err(e.into()),
            None => Err(KvError::Connection(format!(
                "{} closed the connection without replying",
                address
            ))),
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn request(
        &self,
        address: &str,
        message: PeerMessage,
        limit: Duration,
    ) -> Result<PeerMessage> {
        timeout(limit, self.round_trip(address, &message))
            .await
            .map_err(|_| KvError::Timeout(format!("no reply from {} within {:?}", address, limit)))?
    }
}

pub async fn send_ecs(
    transport: &dyn PeerTransport,
    address: &str,
    message: EcsMessage,
    limit: Duration,
) -> Result<EcsMessage> {
    match transport.request(address, message.into(), limit).await? {
        PeerMessage::Ecs(reply) => Ok(reply),
        PeerMessage::Coord(_) => Err(KvError::Protocol(format!(
            "{} answered a control message on the replication channel",
            address
        ))),
    }
}

pub async fn send_coord(
    transport: &dyn PeerTransport,
    address: &str,
    message: CoordMessage,
    limit: Duration,
) -> Result<CoordMessage> {
    match transport.request(address, message.into(), limit).await? {
        PeerMessage::Coord(reply) => Ok(reply),
        PeerMessage::Ecs(_) => Err(KvError::Protocol(format!(
            "{} answered a replication message on the control channel",
            address
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EcsAction;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, LinesCodec::new());
            let line = framed.next().await.unwrap().unwrap();
            let request: PeerMessage = serde_json::from_str(&line).unwrap();
            assert!(matches!(request, PeerMessage::Ecs(ref m) if m.action == EcsAction::Heartbeat));
            let reply = PeerMessage::Ecs(EcsMessage::ok(EcsAction::Heartbeat));
            framed.send(serde_json::to_string(&reply).unwrap()).await.unwrap();
        });

        let reply = send_ecs(
            &TcpTransport::new(),
            &address,
            EcsMessage::new(EcsAction::Heartbeat),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert!(reply.success);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = TcpTransport::new()
            .request(
                &address,
                EcsMessage::new(EcsAction::Heartbeat).into(),
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(KvError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_connectivity_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpTransport::new()
            .request(
                &address,
                EcsMessage::new(EcsAction::Heartbeat).into(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }
}
