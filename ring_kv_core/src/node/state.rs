//! State behind a node's single mutex: lifecycle, write lock, cache,
//! storage file, ring view and replica copies.
//!
//! A key lives either in the cache or in the storage file, never both.

use super::NodeStatus;
use crate::cache::CachePolicy;
use crate::error::Result;
use crate::hash::{HashRange, KeyHash};
use crate::metrics::MetricsCollector;
use crate::replication::ReplicaStore;
use crate::ring::{HashRing, NodeDescriptor};
use crate::storage::FileStorage;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
}

pub struct NodeCore {
    pub(crate) lifecycle: NodeStatus,
    pub(crate) write_lock: bool,
    pub(crate) cache: Box<dyn CachePolicy>,
    pub(crate) storage: FileStorage,
    pub(crate) metadata: Option<HashRing>,
    pub(crate) replicas: ReplicaStore,
    metrics: Arc<MetricsCollector>,
}

impl NodeCore {
    pub fn new(cache: Box<dyn CachePolicy>, storage: FileStorage, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            lifecycle: NodeStatus::Unregistered,
            write_lock: false,
            cache,
            storage,
            metadata: None,
            replicas: ReplicaStore::default(),
            metrics,
        }
    }

    pub fn descriptor(&self, id: &KeyHash) -> Option<&NodeDescriptor> {
        self.metadata.as_ref()?.get(id)
    }

    pub fn owned_range(&self, id: &KeyHash) -> Option<HashRange> {
        self.descriptor(id).map(|d| d.range)
    }

    pub fn owns(&self, id: &KeyHash, key: &str) -> bool {
        self.owned_range(id)
            .map(|range| range.contains_key(key))
            .unwrap_or(false)
    }

    /// Cache first, then storage. A storage hit moves into the cache.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.cache.get(key) {
            self.metrics.record_cache_lookup(true);
            return Ok(Some(value));
        }
        self.metrics.record_cache_lookup(false);

        let Some(value) = self.storage.get(key).await? else {
            return Ok(None);
        };
        if self.cache.capacity() > 0 {
            self.promote(key, &value).await?;
        }
        Ok(Some(value))
    }

    /// Move a stored entry into the cache. The evicted entry is persisted
    /// before the promoted one leaves storage; on error the cache is put
    /// back so nothing exists only in memory.
    async fn promote(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some((evicted_key, evicted_value)) = self.cache.put(key.to_string(), value.to_string()) {
            if let Err(e) = self.storage.put(&evicted_key, &evicted_value).await {
                self.cache.delete(key);
                self.cache.put(evicted_key, evicted_value);
                return Err(e);
            }
            MetricsCollector::incr(&self.metrics.evictions);
        }
        if let Err(e) = self.storage.delete(key).await {
            self.cache.delete(key);
            return Err(e);
        }
        Ok(())
    }

    pub async fn put(&mut self, key: String, value: String) -> Result<PutOutcome> {
        if self.cache.update(&key, value.clone()) {
            return Ok(PutOutcome::Updated);
        }
        let existed = self.storage.delete(&key).await?;
        self.cache_insert(key, value).await?;
        Ok(if existed {
            PutOutcome::Updated
        } else {
            PutOutcome::Inserted
        })
    }

    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        if self.cache.delete(key).is_some() {
            return Ok(true);
        }
        self.storage.delete(key).await
    }

    /// Insert into the cache and persist whatever falls out.
    async fn cache_insert(&mut self, key: String, value: String) -> Result<()> {
        if let Some((evicted_key, evicted_value)) = self.cache.put(key.clone(), value) {
            if evicted_key != key {
                MetricsCollector::incr(&self.metrics.evictions);
            }
            self.storage.put(&evicted_key, &evicted_value).await?;
        }
        Ok(())
    }

    pub async fn entries_in_range(&self, range: &HashRange) -> Result<Vec<(String, String)>> {
        let mut entries: Vec<_> = self
            .cache
            .snapshot()
            .into_iter()
            .filter(|(k, _)| range.contains_key(k))
            .collect();
        entries.extend(self.storage.entries_in_range(range).await?);
        Ok(entries)
    }

    pub async fn all_entries(&self) -> Result<Vec<(String, String)>> {
        let mut entries = self.cache.snapshot();
        entries.extend(self.storage.entries().await?);
        Ok(entries)
    }

    /// Merge migrated entries; cached keys are updated in place.
    pub async fn upsert(&mut self, entries: &[(String, String)]) -> Result<()> {
        let mut to_store = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if !self.cache.update(key, value.clone()) {
                to_store.push((key.clone(), value.clone()));
            }
        }
        self.storage.upsert_many(&to_store).await
    }

    pub async fn remove_range(&mut self, range: &HashRange) -> Result<usize> {
        let cached: Vec<String> = self
            .cache
            .snapshot()
            .into_iter()
            .map(|(k, _)| k)
            .filter(|k| range.contains_key(k))
            .collect();
        for key in &cached {
            self.cache.delete(key);
        }
        Ok(cached.len() + self.storage.remove_range(range).await?)
    }

    /// Write every cached entry to storage and empty the cache.
    pub async fn flush_cache(&mut self) -> Result<usize> {
        let entries = self.cache.snapshot();
        self.storage.upsert_many(&entries).await?;
        self.cache.clear();
        Ok(entries.len())
    }

    /// Adopt replica copies from nodes that are gone from the ring, for
    /// the keys that now fall in `own`. Copies of departed nodes are
    /// dropped afterwards.
    pub async fn promote_orphaned_replicas(&mut self, own: HashRange) -> Result<usize> {
        let Some(ring) = self.metadata.as_ref() else {
            return Ok(0);
        };
        let orphaned: Vec<KeyHash> = self
            .replicas
            .senders()
            .into_iter()
            .filter(|sender| !ring.contains(sender))
            .collect();

        let mut promoted = 0;
        for sender in orphaned {
            let Some(entries) = self.replicas.take(&sender) else {
                continue;
            };
            let mut adopt = Vec::new();
            for (key, value) in entries {
                if !own.contains_key(&key) || self.cache.in_cache(&key) {
                    continue;
                }
                if self.storage.contains(&key).await? {
                    continue;
                }
                adopt.push((key, value));
            }
            promoted += adopt.len();
            self.storage.upsert_many(&adopt).await?;
            tracing::info!("Promoted {} replica entries of departed node {}", adopt.len(), sender);
        }
        Ok(promoted)
    }
}
