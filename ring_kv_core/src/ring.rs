//! Consistent-hash ring of storage nodes.
//!
//! Nodes sit on the ring at `md5(host:port)`. A node owns `(predecessor, own]`
//! and replicates to the (at most) two nodes that follow it.

use crate::cache::CacheStrategy;
use crate::error::{KvError, Result};
use crate::hash::{HashRange, KeyHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Number of neighbours kept on each side for replication.
pub const REPLICA_NEIGHBOURS: usize = 2;

/// Everything the cluster knows about one storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Position on the ring, `md5(host:port)`
    pub id: KeyHash,
    pub host: String,
    pub port: u16,
    /// Owned hash range `(low, high]`
    pub range: HashRange,
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
    #[serde(default)]
    pub cache_size: usize,
    #[serde(default)]
    pub storage_path: String,
    /// Election priority; the highest surviving number takes over coordination
    #[serde(default)]
    pub priority: u32,
    /// Names (`host:port`) of up to two ring predecessors
    #[serde(default)]
    pub predecessors: Vec<String>,
    /// Names (`host:port`) of up to two ring successors, the replica targets
    #[serde(default)]
    pub successors: Vec<String>,
}

impl NodeDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let id = KeyHash::of(&node_name(&host, port));
        Self {
            id,
            host,
            port,
            range: HashRange::full(id),
            cache_strategy: CacheStrategy::default(),
            cache_size: 0,
            storage_path: String::new(),
            priority: 0,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    /// `host:port`, also the address peers connect to.
    pub fn name(&self) -> String {
        node_name(&self.host, self.port)
    }
}

pub fn node_name(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Ring metadata. Shipped whole to every node after each topology change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<NodeDescriptor>", into = "Vec<NodeDescriptor>")]
pub struct HashRing {
    nodes: BTreeMap<KeyHash, NodeDescriptor>,
}

impl From<Vec<NodeDescriptor>> for HashRing {
    fn from(nodes: Vec<NodeDescriptor>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
        }
    }
}

impl From<HashRing> for Vec<NodeDescriptor> {
    fn from(ring: HashRing) -> Self {
        ring.nodes.into_values().collect()
    }
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, node: NodeDescriptor) -> Option<NodeDescriptor> {
        self.nodes.insert(node.id, node)
    }

    pub fn delete(&mut self, id: &KeyHash) -> Option<NodeDescriptor> {
        self.nodes.remove(id)
    }

    pub fn get(&self, id: &KeyHash) -> Option<&NodeDescriptor> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &KeyHash) -> Option<&mut NodeDescriptor> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &KeyHash) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.values().find(|n| n.name() == name)
    }

    /// Closest node strictly below `hash`, wrapping to the highest.
    pub fn predecessor(&self, hash: &KeyHash) -> Option<&NodeDescriptor> {
        self.nodes
            .range(..*hash)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(_, n)| n)
    }

    /// Closest node strictly above `hash`, wrapping to the lowest.
    pub fn successor(&self, hash: &KeyHash) -> Option<&NodeDescriptor> {
        self.nodes
            .range((Excluded(*hash), Unbounded))
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, n)| n)
    }

    /// The node whose range contains `hash`: first node at or above it,
    /// wrapping to the lowest.
    pub fn responsible_node(&self, hash: &KeyHash) -> Option<&NodeDescriptor> {
        self.nodes
            .range(*hash..)
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, n)| n)
    }

    pub fn responsible_for_key(&self, key: &str) -> Option<&NodeDescriptor> {
        self.responsible_node(&KeyHash::of(key))
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyHash> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// Refresh every node's predecessor and successor name lists.
    pub fn recompute_neighbours(&mut self) {
        let ids: Vec<KeyHash> = self.nodes.keys().copied().collect();
        let names: Vec<String> = self.nodes.values().map(|n| n.name()).collect();
        let count = ids.len();
        let fan_out = REPLICA_NEIGHBOURS.min(count.saturating_sub(1));

        for (idx, id) in ids.iter().enumerate() {
            let successors = (1..=fan_out)
                .map(|step| names[(idx + step) % count].clone())
                .collect();
            let predecessors = (1..=fan_out)
                .map(|step| names[(idx + count - step) % count].clone())
                .collect();
            if let Some(node) = self.nodes.get_mut(id) {
                node.successors = successors;
                node.predecessors = predecessors;
            }
        }
    }

    /// Range a node can answer reads for: its own range plus the ranges
    /// of the predecessors it holds replicas of.
    pub fn read_range(&self, id: &KeyHash) -> Option<HashRange> {
        let node = self.nodes.get(id)?;
        if self.size() <= REPLICA_NEIGHBOURS + 1 {
            return Some(HashRange::full(node.range.high));
        }
        let mut low_owner = node;
        for _ in 0..REPLICA_NEIGHBOURS {
            low_owner = self.predecessor(&low_owner.id)?;
        }
        Some(HashRange::new(low_owner.range.low, node.range.high))
    }

    /// `low,high,host:port;...` in ring order.
    pub fn to_keyrange(&self) -> String {
        self.nodes
            .values()
            .map(|n| format!("{},{}", n.range, n.name()))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn to_keyrange_read(&self) -> String {
        self.nodes
            .values()
            .filter_map(|n| {
                self.read_range(&n.id)
                    .map(|r| format!("{},{}", r, n.name()))
            })
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Rebuild routing metadata from a keyrange string. Only ids, hosts,
    /// ports and ranges survive the encoding.
    pub fn from_keyrange(text: &str) -> Result<Self> {
        let mut ring = HashRing::new();
        for entry in text.trim().split(';').filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(',').collect();
            if parts.len() != 3 {
                return Err(KvError::Protocol(format!("malformed keyrange entry '{}'", entry)));
            }
            let low = KeyHash::from_hex(parts[0])?;
            let high = KeyHash::from_hex(parts[1])?;
            let (host, port) = parts[2]
                .rsplit_once(':')
                .ok_or_else(|| KvError::Protocol(format!("malformed address '{}'", parts[2])))?;
            let port = port
                .parse::<u16>()
                .map_err(|e| KvError::Protocol(format!("malformed port '{}': {}", port, e)))?;
            let mut node = NodeDescriptor::new(host, port);
            node.range = HashRange::new(low, high);
            ring.put(node);
        }
        Ok(ring)
    }
}
