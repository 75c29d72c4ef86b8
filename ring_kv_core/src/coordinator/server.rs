use super::Coordinator;
use crate::config::RingConfig;
use crate::error::Result;
use crate::log::log_startup;
use crate::protocol::{EcsAction, EcsMessage, PeerMessage};
use crate::ring::HashRing;
use crate::shutdown::{Shutdown, ShutdownListener, ShutdownSignal};
use crate::transport::{line_codec, PeerTransport};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Accept control connections until shutdown.
pub async fn serve(
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
    mut shutdown: ShutdownListener,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(coordinator, socket).await {
                                tracing::debug!("Control connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept control connection: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Coordinator listener stopped");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(coordinator: Arc<Coordinator>, socket: TcpStream) -> Result<()> {
    let mut framed = Framed::new(socket, line_codec(coordinator.config().network.max_line_bytes));
    while let Some(line) = framed.next().await {
        let line = line?;
        let reply = match serde_json::from_str::<PeerMessage>(&line) {
            Ok(PeerMessage::Ecs(message)) => coordinator.handle(message).await,
            Ok(PeerMessage::Coord(message)) => EcsMessage::failed(
                EcsAction::Heartbeat,
                format!("coordinator does not accept {} replication", message.action),
            ),
            Err(e) => EcsMessage::failed(EcsAction::Heartbeat, format!("malformed message: {}", e)),
        };
        framed
            .send(serde_json::to_string(&PeerMessage::Ecs(reply))?)
            .await?;
    }
    Ok(())
}

/// A running coordinator: listener plus heartbeat loop.
pub struct CoordinatorHandle {
    coordinator: Arc<Coordinator>,
    shutdown: Shutdown,
    local_addr: SocketAddr,
}

impl CoordinatorHandle {
    /// Bind the configured rendezvous address and start serving.
    pub async fn bind(
        config: RingConfig,
        transport: Arc<dyn PeerTransport>,
        ring: HashRing,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.coordinator_address()).await?;
        Ok(Self::start(config, transport, ring, listener))
    }

    pub fn start(
        config: RingConfig,
        transport: Arc<dyn PeerTransport>,
        ring: HashRing,
        listener: TcpListener,
    ) -> Self {
        let local_addr = listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], config.coordinator.port)));
        log_startup("coordinator", &local_addr.to_string());

        let coordinator = Arc::new(Coordinator::with_ring(config, transport, ring));
        let shutdown = Shutdown::new();

        coordinator.spawn_heartbeat(shutdown.subscribe());
        let server = Arc::clone(&coordinator);
        let listener_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve(server, listener, listener_shutdown).await {
                tracing::error!("Coordinator listener failed: {}", e);
            }
        });

        Self {
            coordinator,
            shutdown,
            local_addr,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.shutdown.trigger(ShutdownSignal::Manual);
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
