//! Front Cache Metrics
//!
//! Counters for the write-through front cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Front cache metrics collector
#[derive(Debug, Default)]
pub struct FrontCacheMetrics {
    // Lookups
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,

    // Inner cache traffic
    inner_calls: AtomicU64,
    failures: AtomicU64,
    writes: AtomicU64,

    // Inner fetch latency (microseconds, exponential moving average)
    fetch_latency_us: AtomicU64,
}

impl FrontCacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoized result returned without touching the inner cache
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Keys handed to the inner cache
    pub fn record_misses(&self, keys: u64) {
        self.misses.fetch_add(keys, Ordering::Relaxed);
    }

    /// Caller joined a fetch started by someone else
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inner_call(&self, latency: Duration) {
        self.inner_calls.fetch_add(1, Ordering::Relaxed);
        self.update_latency_ema(latency);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_writes(&self, values: u64) {
        self.writes.fetch_add(values, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.fetch_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .fetch_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn inner_calls(&self) -> u64 {
        self.inner_calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn fetch_latency(&self) -> Duration {
        Duration::from_micros(self.fetch_latency_us.load(Ordering::Relaxed))
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64 + self.coalesced() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn snapshot(&self) -> FrontCacheSnapshot {
        FrontCacheSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            coalesced: self.coalesced(),
            inner_calls: self.inner_calls(),
            failures: self.failures(),
            writes: self.writes(),
            fetch_latency: self.fetch_latency(),
        }
    }
}

/// Point-in-time copy of [`FrontCacheMetrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontCacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub inner_calls: u64,
    pub failures: u64,
    pub writes: u64,
    pub fetch_latency: Duration,
}
