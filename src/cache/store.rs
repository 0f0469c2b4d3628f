//! Persistent key-value store abstraction for the tiered cache.

use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;

use crate::cache::types::CacheKey;

/// Errors surfaced by a persistent store.
///
/// The tiered cache absorbs these on the read path (a failing store is a
/// miss) and reports them on the write path.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem or device failure.
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The configured store location exists but is not usable.
    #[error("store path is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Durable backing tier behind the in-memory cache.
///
/// Implementations own their location on disk (or elsewhere) and enforce
/// their own size budget. Keys are opaque strings; implementations must
/// not interpret them beyond prefix matching.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. `Ok(None)` means the key is absent.
    fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError>;

    /// Write a value, replacing any existing one.
    fn put(&self, key: &CacheKey, value: &[u8]) -> Result<(), StoreError>;

    /// Delete a value. Returns whether the key was present.
    fn remove(&self, key: &CacheKey) -> Result<bool, StoreError>;

    /// Delete every key starting with `prefix`. Returns how many were
    /// removed.
    fn remove_with_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Whether the key is present.
    fn contains(&self, key: &CacheKey) -> Result<bool, StoreError>;

    /// Total stored payload size in bytes.
    fn size_bytes(&self) -> Result<u64, StoreError>;

    /// Number of stored entries.
    fn entry_count(&self) -> Result<usize, StoreError>;

    /// Delete everything.
    fn clear(&self) -> Result<(), StoreError>;
}
