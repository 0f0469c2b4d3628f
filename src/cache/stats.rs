//! Cache statistics tracking.

use std::time::Instant;

/// Counters for one tiered cache, kept under the manager lock.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Lookups answered by the in-memory tier.
    pub memory_hits: u64,
    /// Lookups answered by the persistent tier.
    pub store_hits: u64,
    /// Lookups answered by neither tier.
    pub misses: u64,
    /// Entries dropped because their TTL had passed.
    pub expirations: u64,
    /// Entries evicted from the memory tier by capacity pressure.
    pub memory_evictions: u64,
    /// Successful persistent-tier writes.
    pub store_writes: u64,
    /// Persistent-tier operations that failed and were absorbed.
    pub store_failures: u64,
    /// Current memory-tier size in cost units.
    pub memory_size: u64,
    /// Current memory-tier entry count.
    pub memory_entries: usize,
    /// When counting started.
    pub created_at: Instant,
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStats {
    /// Fresh counters starting now.
    pub fn new() -> Self {
        Self {
            memory_hits: 0,
            store_hits: 0,
            misses: 0,
            expirations: 0,
            memory_evictions: 0,
            store_writes: 0,
            store_failures: 0,
            memory_size: 0,
            memory_entries: 0,
            created_at: Instant::now(),
        }
    }

    /// Fraction of lookups answered by either tier (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.store_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Fraction of lookups answered by the memory tier alone.
    pub fn memory_hit_rate(&self) -> f64 {
        let total = self.memory_hits + self.store_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.memory_hits as f64 / total as f64
        }
    }

    /// Time since counting started.
    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn record_memory_hit(&mut self) {
        self.memory_hits += 1;
    }

    pub(crate) fn record_store_hit(&mut self) {
        self.store_hits += 1;
    }

    pub(crate) fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub(crate) fn record_expiration(&mut self, count: u64) {
        self.expirations += count;
    }

    pub(crate) fn record_memory_eviction(&mut self, count: u64) {
        self.memory_evictions += count;
    }

    pub(crate) fn record_store_write(&mut self) {
        self.store_writes += 1;
    }

    pub(crate) fn record_store_failure(&mut self) {
        self.store_failures += 1;
    }

    pub(crate) fn update_memory_size(&mut self, size: u64, entries: usize) {
        self.memory_size = size;
        self.memory_entries = entries;
    }
}
