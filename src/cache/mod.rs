//! Tiered caching: arena-based LRU, lazy expiry, pinning, and an optional
//! persistent store.
//!
//! [`TieredCache`] is the composition most callers want; [`LruCache`] is
//! the reusable eviction primitive underneath its memory tier.

mod disk;
mod lru;
mod memory;
mod stats;
mod store;
mod tiered;
mod types;

pub use disk::DiskStore;
pub use lru::{EvictionCallback, LruCache, LruIter};
pub use stats::CacheStats;
pub use store::{KeyValueStore, StoreError};
pub use tiered::TieredCache;
pub use types::{
    CacheError, CacheKey, Capacity, MemoryTierConfig, PersistentTierConfig, TieredCacheConfig,
    WriteMode,
};
