//! Pluggable in-memory cache that sits in front of a node's storage file.
//!
//! A policy is chosen once, when the node starts. `put` hands back whatever
//! entry had to make room; the caller owns persisting it.

mod fifo;
mod lfu;
mod lru;

pub use self::fifo::FifoCache;
pub use self::lfu::LfuCache;
pub use self::lru::LruPolicy;

use crate::error::KvError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Eviction strategy of a node cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStrategy {
    /// Caching disabled, every access goes to storage
    None,
    /// First in, first out
    #[default]
    Fifo,
    /// Least recently used
    Lru,
    /// Least frequently used
    Lfu,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheStrategy::None => "NONE",
            CacheStrategy::Fifo => "FIFO",
            CacheStrategy::Lru => "LRU",
            CacheStrategy::Lfu => "LFU",
        };
        f.write_str(name)
    }
}

impl FromStr for CacheStrategy {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(CacheStrategy::None),
            "FIFO" => Ok(CacheStrategy::Fifo),
            "LRU" => Ok(CacheStrategy::Lru),
            "LFU" => Ok(CacheStrategy::Lfu),
            other => Err(KvError::Config(format!("unknown cache strategy '{}'", other))),
        }
    }
}

pub trait CachePolicy: Send + Sync {
    fn strategy(&self) -> CacheStrategy;

    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Membership test; never counts as an access.
    fn in_cache(&self, key: &str) -> bool;

    fn get(&mut self, key: &str) -> Option<String>;

    /// Insert or overwrite. Returns the entry pushed out to make room.
    fn put(&mut self, key: String, value: String) -> Option<(String, String)>;

    /// Overwrite an existing entry. Returns false if the key is not cached.
    fn update(&mut self, key: &str, value: String) -> bool;

    fn delete(&mut self, key: &str) -> Option<String>;

    fn clear(&mut self);

    fn snapshot(&self) -> Vec<(String, String)>;
}

/// Build the cache for a node. A capacity of zero always yields a
/// pass-through cache regardless of strategy.
pub fn build_cache(strategy: CacheStrategy, capacity: usize) -> Box<dyn CachePolicy> {
    if capacity == 0 {
        return Box::new(PassThrough);
    }
    match strategy {
        CacheStrategy::None => Box::new(PassThrough),
        CacheStrategy::Fifo => Box::new(FifoCache::new(capacity)),
        CacheStrategy::Lru => Box::new(LruPolicy::new(capacity)),
        CacheStrategy::Lfu => Box::new(LfuCache::new(capacity)),
    }
}

/// Holds nothing; every `put` comes straight back as the evicted entry.
#[derive(Debug, Default)]
pub struct PassThrough;

impl CachePolicy for PassThrough {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::None
    }

    fn capacity(&self) -> usize {
        0
    }

    fn len(&self) -> usize {
        0
    }

    fn in_cache(&self, _key: &str) -> bool {
        false
    }

    fn get(&mut self, _key: &str) -> Option<String> {
        None
    }

    fn put(&mut self, key: String, value: String) -> Option<(String, String)> {
        Some((key, value))
    }

    fn update(&mut self, _key: &str, _value: String) -> bool {
        false
    }

    fn delete(&mut self, _key: &str) -> Option<String> {
        None
    }

    fn clear(&mut self) {}

    fn snapshot(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}
