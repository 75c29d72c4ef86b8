use crate::cache::CacheStrategy;
use crate::hash::{HashRange, KeyHash};
use crate::ring::{node_name, HashRing};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Control actions between the coordinator and storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EcsAction {
    NewNode,
    Delete,
    SetWriteLock,
    UnsetWriteLock,
    Transfer,
    Append,
    Remove,
    UpdateMetadata,
    Heartbeat,
}

impl fmt::Display for EcsAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EcsAction::NewNode => "NEW_NODE",
            EcsAction::Delete => "DELETE",
            EcsAction::SetWriteLock => "SET_WRITE_LOCK",
            EcsAction::UnsetWriteLock => "UNSET_WRITE_LOCK",
            EcsAction::Transfer => "TRANSFER",
            EcsAction::Append => "APPEND",
            EcsAction::Remove => "REMOVE",
            EcsAction::UpdateMetadata => "UPDATE_METADATA",
            EcsAction::Heartbeat => "HEARTBEAT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn name(&self) -> String {
        node_name(&self.host, self.port)
    }

    pub fn id(&self) -> KeyHash {
        KeyHash::of(&self.name())
    }
}

/// Node settings announced with `NEW_NODE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub cache_strategy: CacheStrategy,
    pub cache_size: usize,
    pub storage_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcsMessage {
    pub action: EcsAction,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<HashRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<HashRing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EcsMessage {
    pub fn new(action: EcsAction) -> Self {
        Self {
            action,
            success: false,
            data: Vec::new(),
            range: None,
            server_info: None,
            nodes: None,
            registration: None,
            error_message: None,
        }
    }

    pub fn ok(action: EcsAction) -> Self {
        Self {
            success: true,
            ..Self::new(action)
        }
    }

    pub fn failed(action: EcsAction, reason: impl Into<String>) -> Self {
        Self {
            error_message: Some(reason.into()),
            ..Self::new(action)
        }
    }

    pub fn with_range(mut self, range: HashRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_server_info(mut self, server_info: ServerInfo) -> Self {
        self.server_info = Some(server_info);
        self
    }

    pub fn with_data(mut self, data: Vec<(String, String)>) -> Self {
        self.data = data;
        self
    }

    pub fn with_nodes(mut self, nodes: HashRing) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn error_text(&self) -> &str {
        self.error_message.as_deref().unwrap_or("no reason given")
    }
}

/// Replication actions between ring neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordAction {
    Put,
    Update,
    Delete,
    ForceSync,
}

impl fmt::Display for CoordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordAction::Put => "PUT",
            CoordAction::Update => "UPDATE",
            CoordAction::Delete => "DELETE",
            CoordAction::ForceSync => "FORCE_SYNC",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordMessage {
    pub action: CoordAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<(String, String)>,
    /// Ring id of the node that owns the replicated data
    pub sender: KeyHash,
    #[serde(default)]
    pub is_success: bool,
}

impl CoordMessage {
    pub fn mutation(
        action: CoordAction,
        sender: KeyHash,
        key: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            action,
            key: Some(key.into()),
            value,
            data: Vec::new(),
            sender,
            is_success: false,
        }
    }

    pub fn force_sync(sender: KeyHash, data: Vec<(String, String)>) -> Self {
        Self {
            action: CoordAction::ForceSync,
            key: None,
            value: None,
            data,
            sender,
            is_success: false,
        }
    }

    pub fn reply(&self, success: bool) -> Self {
        Self {
            action: self.action,
            key: self.key.clone(),
            value: None,
            data: Vec::new(),
            sender: self.sender,
            is_success: success,
        }
    }
}

/// Envelope for everything that travels between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "message", rename_all = "lowercase")]
pub enum PeerMessage {
    Ecs(EcsMessage),
    Coord(CoordMessage),
}

impl From<EcsMessage> for PeerMessage {
    fn from(message: EcsMessage) -> Self {
        PeerMessage::Ecs(message)
    }
}

impl From<CoordMessage> for PeerMessage {
    fn from(message: CoordMessage) -> Self {
        PeerMessage::Coord(message)
    }
}
