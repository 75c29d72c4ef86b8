//! Operation counters for nodes and coordinators
//!
//! Plain atomics; `snapshot` copies them into a serializable struct that the
//! `stats` command returns and shutdown logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct MetricsCollector {
    started: Instant,
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub evictions: AtomicU64,
    pub not_responsible: AtomicU64,
    pub write_lock_rejections: AtomicU64,
    pub replication_pushes: AtomicU64,
    pub replication_failures: AtomicU64,
    pub migrations_started: AtomicU64,
    pub migrations_completed: AtomicU64,
    pub migrations_failed: AtomicU64,
    pub heartbeats_missed: AtomicU64,
    pub elections_won: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    pub evictions: u64,
    pub not_responsible: u64,
    pub write_lock_rejections: u64,
    pub replication_pushes: u64,
    pub replication_failures: u64,
    pub migrations_started: u64,
    pub migrations_completed: u64,
    pub migrations_failed: u64,
    pub heartbeats_missed: u64,
    pub elections_won: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            not_responsible: AtomicU64::new(0),
            write_lock_rejections: AtomicU64::new(0),
            replication_pushes: AtomicU64::new(0),
            replication_failures: AtomicU64::new(0),
            migrations_started: AtomicU64::new(0),
            migrations_completed: AtomicU64::new(0),
            migrations_failed: AtomicU64::new(0),
            heartbeats_missed: AtomicU64::new(0),
            elections_won: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            Self::incr(&self.cache_hits);
        } else {
            Self::incr(&self.cache_misses);
        }
    }

    pub fn record_replication(&self, success: bool) {
        if success {
            Self::incr(&self.replication_pushes);
        } else {
            Self::incr(&self.replication_failures);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let hits = load(&self.cache_hits);
        let misses = load(&self.cache_misses);
        let lookups = hits + misses;

        MetricsSnapshot {
            captured_at: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            gets: load(&self.gets),
            puts: load(&self.puts),
            deletes: load(&self.deletes),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions: load(&self.evictions),
            not_responsible: load(&self.not_responsible),
            write_lock_rejections: load(&self.write_lock_rejections),
            replication_pushes: load(&self.replication_pushes),
            replication_failures: load(&self.replication_failures),
            migrations_started: load(&self.migrations_started),
            migrations_completed: load(&self.migrations_completed),
            migrations_failed: load(&self.migrations_failed),
            heartbeats_missed: load(&self.heartbeats_missed),
            elections_won: load(&self.elections_won),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.snapshot().cache_hit_ratio, 0.0);

        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(false);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_hits, 3);
        assert_eq!(snapshot.cache_misses, 1);
        assert!((snapshot.cache_hit_ratio - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::new();
        MetricsCollector::incr(&metrics.puts);
        metrics.record_replication(false);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.puts, 1);
        assert_eq!(back.replication_failures, 1);
    }
}
