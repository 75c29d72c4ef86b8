pub mod cache;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod hash;
pub mod log;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod ring;
pub mod shutdown;
pub mod storage;
pub mod transport;

pub use cache::{build_cache, CachePolicy, CacheStrategy};
pub use client::KvClient;
pub use config::RingConfig;
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{KvError, Result};
pub use hash::{HashRange, KeyHash};
pub use node::{NodeStatus, StorageNode};
pub use ring::{HashRing, NodeDescriptor};
pub use storage::FileStorage;
pub use transport::{PeerTransport, TcpTransport};
