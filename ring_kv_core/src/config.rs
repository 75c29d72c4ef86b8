//! Configuration for coordinators and storage nodes
//!
//! Settings load from TOML or YAML files (picked by extension) with serde;
//! every section has defaults so partial files are fine.

use crate::cache::CacheStrategy;
use crate::error::{KvError, Result};
use crate::ring::node_name;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Longest line a peer or client may send, 64 MiB. FORCE_SYNC and
/// APPEND carry a whole data set on one line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Storage node settings
    pub node: NodeConfig,
    /// Coordinator (rendezvous) settings
    pub coordinator: CoordinatorConfig,
    /// Node cache settings
    pub cache: CacheConfig,
    /// Replication to ring successors
    pub replication: ReplicationConfig,
    /// Coordinator failure detection and takeover
    pub election: ElectionConfig,
    /// Peer RPC settings
    pub network: NetworkConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host the node binds to and advertises
    pub host: String,
    /// Client and peer port
    pub port: u16,
    /// Directory holding the node's `host_port.txt` file
    pub storage_dir: String,
    /// Answer gets for predecessor ranges from replica data
    pub serve_replica_reads: bool,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Rendezvous host
    pub host: String,
    /// Rendezvous port
    pub port: u16,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a node is dropped
    pub missed_heartbeats: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Eviction strategy
    pub strategy: CacheStrategy,
    /// Maximum cached entries (0 disables caching)
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Push mutations to successors
    pub enabled: bool,
    /// Number of successors that receive copies (1 or 2)
    pub fan_out: usize,
    /// Seconds between full FORCE_SYNC pushes (0 = only on topology change)
    pub force_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Silence from the coordinator, in milliseconds, before a node reacts
    pub coordinator_timeout_ms: u64,
    /// Registration attempts before giving up
    pub reregister_attempts: u32,
    /// Pause between registration attempts in milliseconds
    pub reregister_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout for one peer round trip in milliseconds
    pub rpc_timeout_ms: u64,
    /// Timeout for join/leave requests, which wait on a whole migration
    pub control_timeout_ms: u64,
    /// Longest accepted protocol line in bytes; longer lines close the connection
    pub max_line_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log file path (optional, rotated daily)
    pub file_path: Option<String>,
    /// Enable console output when no file is set
    pub console: bool,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::str::FromStr for LogLevel {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" | "all" => Ok(LogLevel::Trace),
            other => Err(KvError::Config(format!("unknown log level '{}'", other))),
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Single-line text
    Compact,
    /// JSON objects
    Json,
    /// Default multi-field text
    Pretty,
}

impl RingConfig {
    /// Load configuration from a TOML or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| KvError::Config(e.to_string()))
        } else {
            toml::from_str(&content).map_err(|e| KvError::Config(e.to_string()))
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| KvError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.port == 0 {
            errors.push("Node port cannot be 0".to_string());
        }
        if self.node.storage_dir.trim().is_empty() {
            errors.push("Storage directory cannot be empty".to_string());
        }
        if self.coordinator.port == 0 {
            errors.push("Coordinator port cannot be 0".to_string());
        }
        if self.coordinator.heartbeat_interval_ms == 0 {
            errors.push("Heartbeat interval cannot be 0".to_string());
        }
        if self.coordinator.missed_heartbeats == 0 {
            errors.push("Missed heartbeat threshold cannot be 0".to_string());
        }
        if self.election.coordinator_timeout_ms <= self.coordinator.heartbeat_interval_ms {
            errors.push("Coordinator timeout must exceed the heartbeat interval".to_string());
        }
        if self.network.rpc_timeout_ms == 0 {
            errors.push("RPC timeout cannot be 0".to_string());
        }
        if self.network.max_line_bytes == 0 {
            errors.push("Maximum line length cannot be 0".to_string());
        }
        if !(1..=2).contains(&self.replication.fan_out) {
            errors.push("Replication fan-out must be 1 or 2".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn node_address(&self) -> String {
        node_name(&self.node.host, self.node.port)
    }

    pub fn coordinator_address(&self) -> String {
        node_name(&self.coordinator.host, self.coordinator.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.heartbeat_interval_ms)
    }

    pub fn coordinator_timeout(&self) -> Duration {
        Duration::from_millis(self.election.coordinator_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.network.rpc_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.network.control_timeout_ms)
    }

    pub fn reregister_backoff(&self) -> Duration {
        Duration::from_millis(self.election.reregister_backoff_ms)
    }

    /// `None` when periodic syncs are disabled.
    pub fn force_sync_interval(&self) -> Option<Duration> {
        match self.replication.force_sync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            storage_dir: "data".to_string(),
            serve_replica_reads: false,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5100,
            heartbeat_interval_ms: 2000,
            missed_heartbeats: 2,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Fifo,
            capacity: 10,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fan_out: 2,
            force_sync_interval_secs: 0,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            coordinator_timeout_ms: 6000,
            reregister_attempts: 5,
            reregister_backoff_ms: 500,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 3000,
            control_timeout_ms: 30_000,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            file_path: None,
            console: true,
        }
    }
}
