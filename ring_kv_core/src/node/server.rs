use super::StorageNode;
use crate::error::Result;
use crate::protocol::{is_peer_line, ClientRequest, ClientResponse, EcsAction, EcsMessage, PeerMessage};
use crate::shutdown::ShutdownListener;
use crate::transport::line_codec;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Accept client and peer connections until shutdown.
pub async fn serve(
    node: Arc<StorageNode>,
    listener: TcpListener,
    mut shutdown: ShutdownListener,
) -> Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(node, socket).await {
                                tracing::debug!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Listener of {} stopped", node.name());
                return Ok(());
            }
        }
    }
}

async fn handle_connection(node: Arc<StorageNode>, socket: TcpStream) -> Result<()> {
    let mut framed = Framed::new(socket, line_codec(node.config().network.max_line_bytes));
    while let Some(line) = framed.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line = line.trim_start();

        let reply = if is_peer_line(line) {
            let message = match serde_json::from_str::<PeerMessage>(line) {
                Ok(message) => node.handle_peer(message).await,
                Err(e) => PeerMessage::Ecs(EcsMessage::failed(
                    EcsAction::Heartbeat,
                    format!("malformed message: {}", e),
                )),
            };
            serde_json::to_string(&message)?
        } else {
            match line.parse::<ClientRequest>() {
                Ok(request) => node.handle_client(request).await.to_string(),
                Err(e) => ClientResponse::failed(e.to_string()).to_string(),
            }
        };
        framed.send(reply).await?;
    }
    Ok(())
}
