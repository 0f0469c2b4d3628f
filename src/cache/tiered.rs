//! Tiered cache manager: in-memory LRU in front of an optional
//! persistent store.
//!
//! ```text
//!   get/put/remove ──► ┌─────────────────────────────┐
//!                      │ TieredCache   (one lock)    │
//!                      │  ┌──────────┐  ┌──────────┐ │
//!                      │  │ memory   │  │ KeyValue │ │
//!                      │  │ tier     │  │ Store    │ │
//!                      │  └──────────┘  └──────────┘ │
//!                      └─────────────────────────────┘
//! ```
//!
//! One manager-level lock spans both tiers, so a reader never sees a key
//! present in one tier and absent in the other. Expiry is stored with each
//! value (the store keeps it under a `::expiry` sibling key) and checked
//! lazily on read; nothing sweeps proactively. A miss in memory that hits
//! the store promotes the value back into memory with whatever lifetime it
//! has left. Store failures never propagate: a failed read is a miss, a
//! failed write leaves the value memory-only, both under a `warn!`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::disk::DiskStore;
use crate::cache::memory::{Lookup, MemoryTier};
use crate::cache::stats::CacheStats;
use crate::cache::store::{KeyValueStore, StoreError};
use crate::cache::types::{CacheError, CacheKey, TieredCacheConfig, WriteMode};
use crate::scheduler::TaskScheduler;
use crate::time::{system_clock, SharedClock};

/// Suffix of the sibling key the store keeps an entry's expiry under.
const EXPIRY_SUFFIX: &str = "::expiry";

struct CacheInner {
    memory: MemoryTier,
    /// Keys pinned against eviction; survives the entries themselves, so
    /// protection applies to keys inserted later too.
    protected: HashSet<CacheKey>,
    stats: CacheStats,
}

impl CacheInner {
    fn sync_sizes(&mut self) {
        self.stats
            .update_memory_size(self.memory.size(), self.memory.len());
    }
}

/// Two-tier cache with lazy expiry, pinning, and read-through promotion.
pub struct TieredCache {
    inner: Arc<Mutex<CacheInner>>,
    store: Option<Arc<dyn KeyValueStore>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    write_mode: WriteMode,
    default_ttl: Option<Duration>,
    clock: SharedClock,
}

impl TieredCache {
    /// Build a cache from configuration, opening the disk store if a
    /// persistent tier is configured.
    pub fn new(config: TieredCacheConfig) -> Result<Self, CacheError> {
        Self::with_clock(config, system_clock())
    }

    /// Same as [`new`](Self::new) with an injected clock.
    pub fn with_clock(config: TieredCacheConfig, clock: SharedClock) -> Result<Self, CacheError> {
        let store = match &config.persistent {
            Some(persistent) => {
                let disk = DiskStore::open(persistent)?;
                Some(Arc::new(disk) as Arc<dyn KeyValueStore>)
            }
            None => None,
        };
        Ok(Self::assemble(config, store, clock))
    }

    /// Build a cache over a caller-supplied store implementation. The
    /// configured `persistent` tier settings are ignored in favor of the
    /// given store.
    pub fn with_store(
        config: TieredCacheConfig,
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
    ) -> Self {
        Self::assemble(config, Some(store), clock)
    }

    /// Attach a scheduler for [`WriteMode::Background`] store writes.
    /// Without one, background mode degrades to synchronous writes.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    fn assemble(
        config: TieredCacheConfig,
        store: Option<Arc<dyn KeyValueStore>>,
        clock: SharedClock,
    ) -> Self {
        info!(
            capacity = config.memory.capacity.limit(),
            persistent = store.is_some(),
            write_mode = ?config.write_mode,
            "tiered cache ready"
        );
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                memory: MemoryTier::new(config.memory.capacity),
                protected: HashSet::new(),
                stats: CacheStats::new(),
            })),
            store,
            scheduler: None,
            write_mode: config.write_mode,
            default_ttl: config.default_ttl,
            clock,
        }
    }

    /// Store a value under the configured default TTL.
    pub fn put(&self, key: CacheKey, value: Bytes) -> Result<(), CacheError> {
        self.put_with_ttl(key, value, self.default_ttl)
    }

    /// Store a value; `ttl: None` means it never expires, overriding any
    /// configured default.
    ///
    /// The value lands in the memory tier (evicting as needed) and in the
    /// store per the write mode. A value too large for the memory tier is
    /// refused only when no tier ends up holding it.
    pub fn put_with_ttl(
        &self,
        key: CacheKey,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let now = self.clock.now();
        let expires_at = ttl.map(|ttl| now + ttl);

        let mut inner = self.inner.lock();
        let mut refusal = None;
        match inner.memory.put(key.clone(), value.clone(), expires_at, now) {
            Ok(outcome) => {
                inner.stats.record_memory_eviction(outcome.evicted);
                inner.stats.record_expiration(outcome.expired);
                if inner.protected.contains(&key) {
                    inner.memory.protect(&key, true);
                }
            }
            Err(err) => {
                if self.store.is_none() {
                    return Err(err);
                }
                debug!(key = %key, "value exceeds memory tier capacity, store only");
                refusal = Some(err);
            }
        }
        inner.sync_sizes();

        let Some(store) = &self.store else {
            return Ok(());
        };

        match self.write_mode {
            WriteMode::Background if self.scheduler.is_some() => {
                // The scheduled task (and the inline fallback) take the
                // lock themselves.
                drop(inner);
                self.schedule_store_write(store, key, value, expires_at);
                Ok(())
            }
            _ => {
                match write_store_entry(store.as_ref(), &key, &value, expires_at) {
                    Ok(()) => {
                        inner.stats.record_store_write();
                        Ok(())
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "store write failed");
                        inner.stats.record_store_failure();
                        // Memory still holds the value unless it was
                        // refused there as well.
                        match refusal {
                            None => Ok(()),
                            Some(refusal) => Err(refusal),
                        }
                    }
                }
            }
        }
    }

    /// Look up a value. Expired entries read as absent and are removed
    /// from both tiers; a store hit is promoted into the memory tier with
    /// its remaining lifetime.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.memory.get(key, now) {
            Lookup::Hit(data) => {
                inner.stats.record_memory_hit();
                return Some(data);
            }
            Lookup::Expired => {
                // The store copy carries the same expiry; drop it too.
                if let Some(store) = &self.store {
                    purge_store_entry(store.as_ref(), key);
                }
                inner.stats.record_expiration(1);
                inner.stats.record_miss();
                inner.sync_sizes();
                return None;
            }
            Lookup::Miss => {}
        }

        let Some(store) = &self.store else {
            inner.stats.record_miss();
            return None;
        };

        let data = match absorb(&mut inner.stats, key.as_str(), "get", store.get(key)) {
            Some(Some(data)) => data,
            _ => {
                inner.stats.record_miss();
                return None;
            }
        };

        let expires_at = absorb(
            &mut inner.stats,
            key.as_str(),
            "get-expiry",
            store.get(&expiry_key(key)),
        )
        .flatten()
        .and_then(|raw| decode_expiry(&raw));

        if expires_at.is_some_and(|at| at <= now) {
            purge_store_entry(store.as_ref(), key);
            inner.stats.record_expiration(1);
            inner.stats.record_miss();
            return None;
        }

        // Promote with the remaining lifetime. Refusal (value larger than
        // the memory tier) still serves the read from the store.
        match inner.memory.put(key.clone(), data.clone(), expires_at, now) {
            Ok(outcome) => {
                inner.stats.record_memory_eviction(outcome.evicted);
                inner.stats.record_expiration(outcome.expired);
                if inner.protected.contains(key) {
                    inner.memory.protect(key, true);
                }
            }
            Err(err) => debug!(key = %key, error = %err, "promotion skipped"),
        }
        inner.stats.record_store_hit();
        inner.sync_sizes();
        Some(data)
    }

    /// Presence check honoring expiry. Does not promote or purge.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.memory.contains(key, now) {
            return true;
        }

        let Some(store) = &self.store else {
            return false;
        };
        let present = absorb(&mut inner.stats, key.as_str(), "contains", store.contains(key))
            .unwrap_or(false);
        if !present {
            return false;
        }
        match absorb(
            &mut inner.stats,
            key.as_str(),
            "contains-expiry",
            store.get(&expiry_key(key)),
        )
        .flatten()
        .and_then(|raw| decode_expiry(&raw))
        {
            Some(at) => at > now,
            None => true,
        }
    }

    /// Remove a key from both tiers. Returns whether either tier held it.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let from_memory = inner.memory.remove(key);
        inner.sync_sizes();

        let mut from_store = false;
        if let Some(store) = &self.store {
            from_store = absorb(&mut inner.stats, key.as_str(), "remove", store.remove(key))
                .unwrap_or(false);
            absorb(
                &mut inner.stats,
                key.as_str(),
                "remove-expiry",
                store.remove(&expiry_key(key)),
            );
        }
        from_memory || from_store
    }

    /// Remove every key starting with `prefix` from both tiers in one
    /// atomic step with respect to concurrent readers. Returns the number
    /// of entries dropped from the memory tier; store removal covers the
    /// same prefix (expiry siblings included, since they share it).
    pub fn remove_keys_with_prefix(&self, prefix: &str) -> u64 {
        let mut inner = self.inner.lock();
        let removed = inner.memory.remove_with_prefix(prefix);
        inner.sync_sizes();

        if let Some(store) = &self.store {
            absorb(
                &mut inner.stats,
                prefix,
                "remove-prefix",
                store.remove_with_prefix(prefix),
            );
        }
        debug!(prefix, removed, "prefix removal");
        removed
    }

    /// Pin entries against eviction. Keys not yet cached are pinned when
    /// they arrive.
    pub fn protect(&self, keys: &[CacheKey]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.protected.insert(key.clone());
            inner.memory.protect(key, true);
        }
    }

    /// Undo [`protect`](Self::protect) for the given keys.
    pub fn release(&self, keys: &[CacheKey]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.protected.remove(key);
            inner.memory.protect(key, false);
        }
    }

    /// Empty both tiers. The protected set is kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.memory.clear();
        inner.sync_sizes();
        if let Some(store) = &self.store {
            absorb(&mut inner.stats, "", "clear", store.clear());
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let mut inner = self.inner.lock();
        inner.sync_sizes();
        inner.stats.clone()
    }

    /// Emit the counters through `tracing` at info level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            memory_hits = stats.memory_hits,
            store_hits = stats.store_hits,
            misses = stats.misses,
            expirations = stats.expirations,
            hit_rate = format_args!("{:.3}", stats.hit_rate()),
            memory_entries = stats.memory_entries,
            memory_size = stats.memory_size,
            "cache statistics"
        );
    }

    fn schedule_store_write(
        &self,
        store: &Arc<dyn KeyValueStore>,
        key: CacheKey,
        value: Bytes,
        expires_at: Option<SystemTime>,
    ) {
        // Only reached when a scheduler is attached.
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let store = Arc::clone(store);
        let task_key = key.clone();
        let task_value = value.clone();
        let task = Box::new(move || {
            let mut inner = inner.lock();
            match write_store_entry(store.as_ref(), &task_key, &task_value, expires_at) {
                Ok(()) => inner.stats.record_store_write(),
                Err(err) => {
                    warn!(key = %task_key, error = %err, "background store write failed");
                    inner.stats.record_store_failure();
                }
            }
        });

        if scheduler.schedule(task).is_err() {
            // Pool already shut down; fall back to writing inline.
            let mut inner = self.inner.lock();
            if let Some(store) = &self.store {
                match write_store_entry(store.as_ref(), &key, &value, expires_at) {
                    Ok(()) => inner.stats.record_store_write(),
                    Err(err) => {
                        warn!(key = %key, error = %err, "store write failed");
                        inner.stats.record_store_failure();
                    }
                }
            }
        }
    }
}

/// Log and count a store failure, yielding the success value if any.
fn absorb<T>(
    stats: &mut CacheStats,
    key: &str,
    op: &str,
    result: Result<T, StoreError>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, op, error = %err, "store operation failed, absorbed");
            stats.record_store_failure();
            None
        }
    }
}

fn expiry_key(key: &CacheKey) -> CacheKey {
    CacheKey::new(format!("{}{EXPIRY_SUFFIX}", key.as_str()))
}

/// Epoch seconds as decimal text; human-readable when inspecting a store
/// directory.
fn encode_expiry(at: SystemTime) -> Vec<u8> {
    let seconds = at
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    seconds.to_string().into_bytes()
}

fn decode_expiry(raw: &[u8]) -> Option<SystemTime> {
    let seconds: u64 = std::str::from_utf8(raw).ok()?.trim().parse().ok()?;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(seconds))
}

fn write_store_entry(
    store: &dyn KeyValueStore,
    key: &CacheKey,
    value: &[u8],
    expires_at: Option<SystemTime>,
) -> Result<(), StoreError> {
    store.put(key, value)?;
    match expires_at {
        Some(at) => store.put(&expiry_key(key), &encode_expiry(at))?,
        // An update may drop a previous TTL; remove any stale sibling.
        None => {
            store.remove(&expiry_key(key))?;
        }
    }
    Ok(())
}

/// Best-effort removal of an expired entry and its expiry sibling.
fn purge_store_entry(store: &dyn KeyValueStore, key: &CacheKey) {
    let data = store.remove(key);
    let sibling = store.remove(&expiry_key(key));
    if let Err(err) = data.and(sibling) {
        warn!(key = %key, error = %err, "failed to drop expired store entry");
    }
}
