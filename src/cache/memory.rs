//! In-memory cache tier: LRU eviction plus per-entry expiry.
//!
//! Wraps the arena [`LruCache`] with absolute expiry times. Expired
//! entries are dropped lazily: a read of an expired key removes it on the
//! spot, and every write first purges everything whose expiry has passed.
//! A `BTreeMap` keyed by expiry time makes that purge touch only the
//! entries that are actually due.
//!
//! The tier is deliberately not synchronized; the tiered cache manager
//! owns it behind a single lock together with the persistent tier.

use std::collections::{BTreeMap, HashSet};
use std::time::SystemTime;

use bytes::Bytes;

use crate::cache::lru::LruCache;
use crate::cache::types::{CacheError, CacheKey, Capacity};

#[derive(Debug, Clone)]
pub(crate) struct MemoryEntry {
    pub data: Bytes,
    pub expires_at: Option<SystemTime>,
}

/// Result of a tier lookup; `Expired` means the entry was present but past
/// its expiry and has been removed.
pub(crate) enum Lookup {
    Hit(Bytes),
    Expired,
    Miss,
}

/// Side effects of a write, for the manager's statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PutOutcome {
    pub evicted: u64,
    pub expired: u64,
}

fn unit_cost(_: &MemoryEntry) -> u64 {
    1
}

fn byte_cost(entry: &MemoryEntry) -> u64 {
    entry.data.len() as u64
}

pub(crate) struct MemoryTier {
    lru: LruCache<CacheKey, MemoryEntry>,
    /// Expiry time to the keys due at that time. Keys evicted before their
    /// expiry leave a stale set member behind; the purge skips those.
    expiry_buckets: BTreeMap<SystemTime, HashSet<CacheKey>>,
}

impl MemoryTier {
    pub fn new(capacity: Capacity) -> Self {
        let lru = match capacity {
            Capacity::Items(n) => LruCache::with_cost(n, unit_cost),
            Capacity::Bytes(n) => LruCache::with_cost(n, byte_cost),
        };
        Self {
            lru,
            expiry_buckets: BTreeMap::new(),
        }
    }

    /// Insert or update, purging due entries first so they free capacity
    /// before eviction is considered.
    pub fn put(
        &mut self,
        key: CacheKey,
        data: Bytes,
        expires_at: Option<SystemTime>,
        now: SystemTime,
    ) -> Result<PutOutcome, CacheError> {
        let expired = self.purge_expired(now);

        let len_before = self.lru.len();
        let was_present = self.lru.contains(&key);
        let old = self.lru.insert(
            key.clone(),
            MemoryEntry {
                data,
                expires_at,
            },
        )?;

        if let Some(old_expiry) = old.and_then(|entry| entry.expires_at) {
            self.drop_bucket_member(old_expiry, &key);
        }
        if let Some(at) = expires_at {
            self.expiry_buckets.entry(at).or_default().insert(key);
        }

        let evicted = (len_before + usize::from(!was_present) - self.lru.len()) as u64;
        Ok(PutOutcome { evicted, expired })
    }

    /// Look up and promote. An entry past its expiry is removed and
    /// reported as [`Lookup::Expired`].
    pub fn get(&mut self, key: &CacheKey, now: SystemTime) -> Lookup {
        let expired = match self.lru.find_no_promote(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            self.remove(key);
            return Lookup::Expired;
        }
        match self.lru.find(key) {
            Some(entry) => Lookup::Hit(entry.data.clone()),
            None => Lookup::Miss,
        }
    }

    /// Presence without promotion; expired entries read as absent.
    pub fn contains(&self, key: &CacheKey, now: SystemTime) -> bool {
        self.lru
            .find_no_promote(key)
            .is_some_and(|entry| !entry.expires_at.is_some_and(|at| at <= now))
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.lru.remove(key) else {
            return false;
        };
        if let Some(at) = entry.expires_at {
            self.drop_bucket_member(at, key);
        }
        true
    }

    /// Remove every entry whose key starts with `prefix`; returns how many
    /// were dropped.
    pub fn remove_with_prefix(&mut self, prefix: &str) -> u64 {
        let matches: Vec<CacheKey> = self
            .lru
            .iter()
            .filter(|(key, _)| key.has_prefix(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matches {
            self.remove(key);
        }
        matches.len() as u64
    }

    /// Pin or unpin an entry. Returns `false` if the key is absent.
    pub fn protect(&mut self, key: &CacheKey, pinned: bool) -> bool {
        self.lru.pin(key, pinned)
    }

    pub fn clear(&mut self) {
        self.lru.clear();
        self.expiry_buckets.clear();
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn size(&self) -> u64 {
        self.lru.size()
    }

    /// Drop every entry whose expiry is at or before `now`. Returns the
    /// number actually removed (stale bucket members do not count).
    pub fn purge_expired(&mut self, now: SystemTime) -> u64 {
        let mut removed = 0;
        loop {
            match self.expiry_buckets.first_key_value() {
                Some((&at, _)) if at <= now => {
                    if let Some((_, keys)) = self.expiry_buckets.pop_first() {
                        for key in keys {
                            if self.lru.remove(&key).is_some() {
                                removed += 1;
                            }
                        }
                    }
                }
                _ => break,
            }
        }
        removed
    }

    fn drop_bucket_member(&mut self, at: SystemTime, key: &CacheKey) {
        if let Some(bucket) = self.expiry_buckets.get_mut(&at) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.expiry_buckets.remove(&at);
            }
        }
    }
}
