//! Cache Metrics Collection
//!
//! Counters for tier hits, blocking reads and L1 sizing, readable as a
//! serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Writes
    adds: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    clears: AtomicU64,
    rolling_evictions: AtomicU64,

    // Tier lookups
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l1_replenished: AtomicU64,

    // Blocking reads
    waits: AtomicU64,
    wakeups: AtomicU64,
    cancellations: AtomicU64,

    // Adaptive sizing
    grows: AtomicU64,
    shrinks: AtomicU64,
    l1_target: AtomicU64,

    // Remote order changes
    remote_changes: AtomicU64,

    // Add latency (microseconds, exponential moving average)
    add_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_add(&self, duration: Duration) {
        self.adds.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(&self.add_latency_us, duration);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rolling_eviction(&self) {
        self.rolling_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_miss(&self) {
        self.l1_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_miss(&self) {
        self.l2_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replenished(&self, count: usize) {
        self.l1_replenished
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grow(&self, target: usize) {
        self.grows.fetch_add(1, Ordering::Relaxed);
        self.l1_target.store(target as u64, Ordering::Relaxed);
    }

    pub fn record_shrink(&self, target: usize) {
        self.shrinks.fetch_add(1, Ordering::Relaxed);
        self.l1_target.store(target as u64, Ordering::Relaxed);
    }

    pub fn set_l1_target(&self, target: usize) {
        self.l1_target.store(target as u64, Ordering::Relaxed);
    }

    pub fn record_remote_changes(&self, count: usize) {
        self.remote_changes
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn l1_hits(&self) -> u64 {
        self.l1_hits.load(Ordering::Relaxed)
    }

    pub fn l1_misses(&self) -> u64 {
        self.l1_misses.load(Ordering::Relaxed)
    }

    pub fn l2_hits(&self) -> u64 {
        self.l2_hits.load(Ordering::Relaxed)
    }

    pub fn l1_hit_ratio(&self) -> f64 {
        let hits = self.l1_hits() as f64;
        let total = hits + self.l1_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn add_latency(&self) -> Duration {
        Duration::from_micros(self.add_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            adds: self.adds.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            rolling_evictions: self.rolling_evictions.load(Ordering::Relaxed),

            l1_hits: self.l1_hits(),
            l1_misses: self.l1_misses(),
            l1_hit_ratio: self.l1_hit_ratio(),
            l2_hits: self.l2_hits(),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            l1_replenished: self.l1_replenished.load(Ordering::Relaxed),

            waits: self.waits.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),

            grows: self.grows.load(Ordering::Relaxed),
            shrinks: self.shrinks.load(Ordering::Relaxed),
            l1_target: self.l1_target.load(Ordering::Relaxed),

            remote_changes: self.remote_changes.load(Ordering::Relaxed),
            add_latency_us: self.add_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub adds: u64,
    pub updates: u64,
    pub removes: u64,
    pub clears: u64,
    pub rolling_evictions: u64,

    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_hit_ratio: f64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l1_replenished: u64,

    pub waits: u64,
    pub wakeups: u64,
    pub cancellations: u64,

    pub grows: u64,
    pub shrinks: u64,
    pub l1_target: u64,

    pub remote_changes: u64,
    pub add_latency_us: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
