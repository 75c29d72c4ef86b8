use super::{CachePolicy, CacheStrategy};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug)]
struct LfuEntry {
    value: String,
    frequency: u64,
}

/// Frequency-bucketed cache. Ties inside a bucket go to the key that
/// entered the bucket first.
#[derive(Debug)]
pub struct LfuCache {
    capacity: usize,
    entries: HashMap<String, LfuEntry>,
    buckets: BTreeMap<u64, VecDeque<String>>,
}

impl LfuCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            buckets: BTreeMap::new(),
        }
    }

    /// Access frequency of a cached key.
    pub fn frequency(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.frequency)
    }

    fn unlink(&mut self, key: &str, frequency: u64) {
        if let Some(bucket) = self.buckets.get_mut(&frequency) {
            if let Some(pos) = bucket.iter().position(|k| k == key) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                self.buckets.remove(&frequency);
            }
        }
    }

    fn touch(&mut self, key: &str) {
        let frequency = match self.entries.get_mut(key) {
            Some(entry) => {
                entry.frequency += 1;
                entry.frequency
            }
            None => return,
        };
        self.unlink(key, frequency - 1);
        self.buckets
            .entry(frequency)
            .or_default()
            .push_back(key.to_string());
    }

    fn evict(&mut self) -> Option<(String, String)> {
        let mut lowest = self.buckets.first_entry()?;
        let key = lowest.get_mut().pop_front();
        if lowest.get().is_empty() {
            lowest.remove();
        }
        let key = key?;
        self.entries.remove(&key).map(|e| (key, e.value))
    }
}

impl CachePolicy for LfuCache {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Lfu
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
        let value = self.entries.get(key)?.value.clone();
        self.touch(key);
        Some(value)
    }

    fn put(&mut self, key: String, value: String) -> Option<(String, String)> {
        if self.update(&key, value.clone()) {
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict()
        } else {
            None
        };

        self.buckets.entry(1).or_default().push_back(key.clone());
        self.entries.insert(key, LfuEntry { value, frequency: 1 });
        evicted
    }

    fn update(&mut self, key: &str, value: String) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                self.touch(key);
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &str) -> Option<String> {
        let entry = self.entries.remove(key)?;
        self.unlink(key, entry.frequency);
        Some(entry.value)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.buckets.clear();
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}
