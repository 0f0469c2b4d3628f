//! Shared cache types: keys, capacity units, configuration, and errors.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::store::StoreError;

/// Key addressing one cached entry.
///
/// Opaque ordered string; related entries share prefixes (e.g.
/// `layer/partition/version`) so whole families can be dropped with
/// [`remove_keys_with_prefix`](crate::cache::TieredCache::remove_keys_with_prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key begins with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// How the in-memory tier measures fullness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Up to this many entries, each costing 1.
    Items(u64),
    /// Up to this many payload bytes.
    Bytes(u64),
}

impl Capacity {
    /// The numeric limit in the unit's own terms.
    pub fn limit(&self) -> u64 {
        match self {
            Capacity::Items(n) | Capacity::Bytes(n) => *n,
        }
    }
}

/// How `put` propagates to the persistent tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Write to the store before `put` returns.
    #[default]
    WriteThrough,
    /// Write to the store on the scheduler; `put` returns after the
    /// memory-tier write.
    Background,
}

/// In-memory tier configuration.
#[derive(Debug, Clone, Copy)]
pub struct MemoryTierConfig {
    /// Capacity of the tier (items or bytes).
    pub capacity: Capacity,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            // 64 MiB of payload by default.
            capacity: Capacity::Bytes(64 * 1024 * 1024),
        }
    }
}

/// Persistent tier configuration.
#[derive(Debug, Clone)]
pub struct PersistentTierConfig {
    /// Directory the store keeps its files in.
    pub path: PathBuf,
    /// Byte budget for the store; oldest entries are evicted past it.
    pub max_size_bytes: u64,
}

impl PersistentTierConfig {
    /// Configure a persistent tier rooted at `path` with a 1 GiB budget.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size_bytes: 1024 * 1024 * 1024,
        }
    }

    /// Set the store's byte budget.
    pub fn with_max_size_bytes(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }
}

/// Whole-cache configuration.
#[derive(Debug, Clone, Default)]
pub struct TieredCacheConfig {
    /// In-memory tier settings.
    pub memory: MemoryTierConfig,
    /// Optional persistent tier; `None` means memory-only.
    pub persistent: Option<PersistentTierConfig>,
    /// TTL applied when `put` is called without one; `None` means entries
    /// never expire by default.
    pub default_ttl: Option<Duration>,
    /// Synchronous or background write-through.
    pub write_mode: WriteMode,
}

impl TieredCacheConfig {
    /// Memory-only cache with the given capacity.
    pub fn memory_only(capacity: Capacity) -> Self {
        Self {
            memory: MemoryTierConfig { capacity },
            ..Self::default()
        }
    }

    /// Set the in-memory capacity.
    pub fn with_memory_capacity(mut self, capacity: Capacity) -> Self {
        self.memory.capacity = capacity;
        self
    }

    /// Enable the persistent tier.
    pub fn with_persistent_tier(mut self, persistent: PersistentTierConfig) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Set the default TTL for entries stored without an explicit one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set the write-through mode.
    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }
}

/// Cache operation errors.
///
/// A plain miss is not an error; lookups return `Option`. Persistent-tier
/// failures are absorbed by the manager and surface here only from
/// construction.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The entry cannot fit even after evicting everything evictable.
    /// The entry was not stored; the cache is unchanged.
    #[error("entry cost {cost} cannot fit within capacity {capacity}")]
    CapacityRefused { cost: u64, capacity: u64 },

    /// Persistent tier could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}
