use super::{CachePolicy, CacheStrategy};
use std::collections::{HashMap, VecDeque};

/// Evicts in insertion order. Reads and overwrites do not reorder.
#[derive(Debug)]
pub struct FifoCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl FifoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn evict_oldest(&mut self) -> Option<(String, String)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(value) = self.entries.remove(&key) {
                return Some((key, value));
            }
        }
        None
    }
}

impl CachePolicy for FifoCache {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Fifo
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn in_cache(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, value: String) -> Option<(String, String)> {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    fn update(&mut self, key: &str, value: String) -> bool {
        match self.entries.get_mut(key) {
            Some(existing) => {
                *existing = value;
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &str) -> Option<String> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}
