use super::{CachePolicy, CacheStrategy};
use ::lru::LruCache;
use std::num::NonZeroUsize;

/// Access-ordered cache backed by `lru::LruCache`.
pub struct LruPolicy {
    inner: LruCache<String, String>,
}

impl LruPolicy {
    /// `capacity` must be non-zero; zero is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }
}

impl CachePolicy for LruPolicy {
    fn strategy(&self) -> CacheStrategy {
        CacheStrategy::Lru
    }

    fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn in_cache(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    fn put(&mut self, key: String, value: String) -> Option<(String, String)> {
        if self.inner.contains(&key) {
            self.inner.put(key, value);
            return None;
        }
        self.inner.push(key, value)
    }

    fn update(&mut self, key: &str, value: String) -> bool {
        match self.inner.get_mut(key) {
            Some(existing) => {
                *existing = value;
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &str) -> Option<String> {
        self.inner.pop(key)
    }

    fn clear(&mut self) {
        self.inner.clear();
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.inner
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
