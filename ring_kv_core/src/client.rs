//! Client library for the text protocol.
//!
//! Routes each key to the node its cached ring says is responsible. A
//! `SERVER_NOT_RESPONSIBLE` reply carries fresh metadata; the client
//! adopts it and retries once. Stopped or unreachable nodes send the
//! client back to its bootstrap node.

use crate::config::DEFAULT_MAX_LINE_BYTES;
use crate::error::{KvError, Result};
use crate::protocol::{ClientRequest, ClientResponse, DELETE_SENTINEL};
use crate::ring::HashRing;
use crate::transport::line_codec;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct KvClient {
    bootstrap: String,
    metadata: Option<HashRing>,
    timeout: Duration,
    max_line_bytes: usize,
}

impl KvClient {
    /// `bootstrap` is any node's `host:port`; it serves requests until
    /// metadata is known.
    pub fn new(bootstrap: impl Into<String>) -> Self {
        Self {
            bootstrap: bootstrap.into(),
            metadata: None,
            timeout: DEFAULT_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn metadata(&self) -> Option<&HashRing> {
        self.metadata.as_ref()
    }

    /// One request to one node, no routing.
    pub async fn request_at(&self, address: &str, request: &ClientRequest) -> Result<ClientResponse> {
        timeout(self.timeout, exchange(address, request, self.max_line_bytes))
            .await
            .map_err(|_| KvError::Timeout(format!("no reply from {} within {:?}", address, self.timeout)))?
    }

    pub async fn execute(&mut self, request: ClientRequest) -> Result<ClientResponse> {
        let target = self.route(&request);
        let response = match self.request_at(&target, &request).await {
            Ok(response) => response,
            Err(e) if e.is_connectivity() && target != self.bootstrap => {
                debug!("{} unreachable ({}), falling back to {}", target, e, self.bootstrap);
                self.metadata = None;
                let bootstrap = self.bootstrap.clone();
                self.request_at(&bootstrap, &request).await?
            }
            Err(e) => return Err(e),
        };
        let response = match response {
            ClientResponse::ServerStopped if target != self.bootstrap => {
                debug!("{} has stopped, falling back to {}", target, self.bootstrap);
                self.metadata = None;
                let bootstrap = self.bootstrap.clone();
                self.request_at(&bootstrap, &request).await?
            }
            other => other,
        };

        let metadata = match response {
            ClientResponse::ServerNotResponsible { metadata } => metadata,
            other => return Ok(other),
        };
        let ring = HashRing::from_keyrange(&metadata)?;
        if ring.is_empty() {
            return Ok(ClientResponse::ServerNotResponsible { metadata });
        }
        self.metadata = Some(ring);
        let retry = self.route(&request);
        debug!("Retrying {} at {}", request, retry);
        self.request_at(&retry, &request).await
    }

    fn route(&self, request: &ClientRequest) -> String {
        match (request.key(), &self.metadata) {
            (Some(key), Some(ring)) => ring
                .responsible_for_key(key)
                .map(|node| node.name())
                .unwrap_or_else(|| self.bootstrap.clone()),
            _ => self.bootstrap.clone(),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<ClientResponse> {
        self.execute(ClientRequest::get(key)).await
    }

    pub async fn put(&mut self, key: &str, value: &str) -> Result<ClientResponse> {
        self.execute(ClientRequest::put(key, value)).await
    }

    pub async fn delete(&mut self, key: &str) -> Result<ClientResponse> {
        self.put(key, DELETE_SENTINEL).await
    }

    pub async fn stats(&mut self) -> Result<ClientResponse> {
        self.execute(ClientRequest::Stats).await
    }

    pub async fn keyrange_read(&mut self) -> Result<ClientResponse> {
        self.execute(ClientRequest::KeyRangeRead).await
    }

    /// Ask the bootstrap node for the ring and route by it from now on.
    pub async fn refresh_metadata(&mut self) -> Result<HashRing> {
        match self.execute(ClientRequest::KeyRange).await? {
            ClientResponse::KeyRangeSuccess { ranges } => {
                let ring = HashRing::from_keyrange(&ranges)?;
                self.metadata = Some(ring.clone());
                Ok(ring)
            }
            other => Err(KvError::Protocol(format!("keyrange request answered with {}", other))),
        }
    }
}

async fn exchange(address: &str, request: &ClientRequest, max_line_bytes: usize) -> Result<ClientResponse> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| KvError::Connection(format!("{}: {}", address, e)))?;
    let mut framed = Framed::new(stream, line_codec(max_line_bytes));
    framed.send(request.to_string()).await?;
    match framed.next().await {
        Some(line) => line?.parse(),
        None => Err(KvError::Connection(format!(
            "{} closed the connection without replying",
            address
        ))),
    }
}
