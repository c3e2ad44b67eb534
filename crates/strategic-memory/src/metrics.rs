//! Observability counters for the storage engine.
//!
//! Degraded-backend recoveries and propagation drops are recovered silently
//! on the operation path; these counters are the only place they surface.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic counters shared across the coordinator and memory layers.
pub struct StorageCounters {
    pub record_writes: AtomicUsize,
    pub record_reads: AtomicUsize,
    pub propagated: AtomicUsize,
    pub propagation_dropped: AtomicUsize,
    pub degraded_fallbacks: AtomicUsize,
    pub contention_retries: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub cache_misses: AtomicUsize,
}

/// Point-in-time copy of the counters, safe to serialize and log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CounterSnapshot {
    pub record_writes: usize,
    pub record_reads: usize,
    pub propagated: usize,
    pub propagation_dropped: usize,
    pub degraded_fallbacks: usize,
    pub contention_retries: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

impl StorageCounters {
    pub fn new() -> Self {
        Self {
            record_writes: AtomicUsize::new(0),
            record_reads: AtomicUsize::new(0),
            propagated: AtomicUsize::new(0),
            propagation_dropped: AtomicUsize::new(0),
            degraded_fallbacks: AtomicUsize::new(0),
            contention_retries: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            cache_misses: AtomicUsize::new(0),
        }
    }

    pub fn inc_record_writes(&self) -> usize {
        self.record_writes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_record_reads(&self) -> usize {
        self.record_reads.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_propagated(&self) -> usize {
        self.propagated.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_propagation_dropped(&self) -> usize {
        self.propagation_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_degraded_fallbacks(&self) -> usize {
        self.degraded_fallbacks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_contention_retries(&self) -> usize {
        self.contention_retries.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_cache_hit(&self) -> usize {
        self.cache_hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_cache_miss(&self) -> usize {
        self.cache_misses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            record_writes: self.record_writes.load(Ordering::Relaxed),
            record_reads: self.record_reads.load(Ordering::Relaxed),
            propagated: self.propagated.load(Ordering::Relaxed),
            propagation_dropped: self.propagation_dropped.load(Ordering::Relaxed),
            degraded_fallbacks: self.degraded_fallbacks.load(Ordering::Relaxed),
            contention_retries: self.contention_retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for StorageCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = StorageCounters::new();
        let snap = counters.snapshot();
        assert_eq!(snap.record_writes, 0);
        assert_eq!(snap.propagation_dropped, 0);
        assert_eq!(snap.degraded_fallbacks, 0);
    }

    #[test]
    fn test_increment_returns_new_value() {
        let counters = StorageCounters::new();
        assert_eq!(counters.inc_record_writes(), 1);
        assert_eq!(counters.inc_record_writes(), 2);
        assert_eq!(counters.snapshot().record_writes, 2);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let counters = StorageCounters::new();
        counters.inc_cache_hit();
        let snap = counters.snapshot();
        counters.inc_cache_hit();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(counters.snapshot().cache_hits, 2);
    }
}
