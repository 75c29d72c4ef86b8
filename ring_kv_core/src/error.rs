//! Error types shared by the coordinator, the storage nodes and the client.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("line codec error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("write lock: {0}")]
    WriteLock(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("election failed: {0}")]
    Election(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KvError {
    /// Errors caused by an unreachable or silent peer.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            KvError::Timeout(_) | KvError::Connection(_) | KvError::Io(_)
        )
    }
}
