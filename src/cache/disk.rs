//! File-per-entry persistent store.
//!
//! Each entry is one file in a flat directory; the filename is the cache
//! key with every byte outside `[A-Za-z0-9_-]` percent-encoded, so any key
//! round-trips through the filesystem. An in-memory index (key to payload
//! length) is rebuilt by scanning the directory on open, which is how
//! entries survive restarts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::store::{KeyValueStore, StoreError};
use crate::cache::types::{CacheKey, PersistentTierConfig};

const ENTRY_EXTENSION: &str = "bin";

/// Fraction of the budget to trim down to once it is exceeded, so each
/// overrun does not trigger another eviction immediately.
const EVICTION_TARGET_RATIO: f64 = 0.9;

#[derive(Default)]
struct StoreState {
    /// Key to payload length in bytes.
    index: HashMap<CacheKey, u64>,
    size_bytes: u64,
}

/// Durable store keeping one file per cache entry.
///
/// Enforces its byte budget by deleting the oldest-modified files before
/// a write that would exceed it, so the directory never grows past the
/// budget even transiently.
pub struct DiskStore {
    root: PathBuf,
    max_size_bytes: u64,
    state: Mutex<StoreState>,
}

impl DiskStore {
    /// Open a store rooted at the configured directory, creating it if
    /// needed, and rebuild the index from the files already present.
    pub fn open(config: &PersistentTierConfig) -> Result<Self, StoreError> {
        if config.path.exists() && !config.path.is_dir() {
            return Err(StoreError::NotADirectory(config.path.clone()));
        }
        fs::create_dir_all(&config.path)?;

        let store = Self {
            root: config.path.clone(),
            max_size_bytes: config.max_size_bytes,
            state: Mutex::new(StoreState::default()),
        };
        store.scan()?;
        store.evict_to_budget(0)?;

        let state = store.state.lock();
        info!(
            entries = state.index.len(),
            size_bytes = state.size_bytes,
            path = %store.root.display(),
            "persistent store opened"
        );
        drop(state);

        Ok(store)
    }

    /// Budget in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!("{}.{ENTRY_EXTENSION}", encode_key(key)))
    }

    /// Rebuild the index from the directory contents. Files that are not
    /// valid entries are left alone.
    fn scan(&self) -> Result<(), StoreError> {
        let mut index = HashMap::new();
        let mut total = 0u64;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(key) = decode_entry_filename(&path) else {
                continue;
            };
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            total += metadata.len();
            index.insert(key, metadata.len());
        }

        let mut state = self.state.lock();
        state.index = index;
        state.size_bytes = total;
        Ok(())
    }

    /// Delete oldest-modified entries until the store, plus `incoming`
    /// bytes about to be written, fits inside the eviction target. No-op
    /// while the budget holds.
    fn evict_to_budget(&self, incoming: u64) -> Result<(), StoreError> {
        let state = self.state.lock();
        if state.size_bytes + incoming <= self.max_size_bytes {
            return Ok(());
        }

        let mut entries: Vec<(CacheKey, SystemTime, u64)> = Vec::new();
        for (key, &len) in state.index.iter() {
            let path = self.entry_path(key);
            if let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) {
                entries.push((key.clone(), modified, len));
            }
        }
        drop(state);

        entries.sort_by_key(|(_, modified, _)| *modified);

        let target = (self.max_size_bytes as f64 * EVICTION_TARGET_RATIO) as u64;
        let mut removed = 0u64;
        let mut freed = 0u64;
        for (key, _, len) in entries {
            {
                let state = self.state.lock();
                if state.size_bytes + incoming <= target {
                    break;
                }
            }
            let _ = fs::remove_file(self.entry_path(&key));
            let mut state = self.state.lock();
            if state.index.remove(&key).is_some() {
                state.size_bytes = state.size_bytes.saturating_sub(len);
                removed += 1;
                freed += len;
            }
        }

        info!(removed, freed_bytes = freed, "persistent store trimmed to budget");
        Ok(())
    }
}

impl KeyValueStore for DiskStore {
    fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        {
            let state = self.state.lock();
            if !state.index.contains_key(key) {
                return Ok(None);
            }
        }

        match fs::read(self.entry_path(key)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) => {
                // Vanished or unreadable file: drop it from the index and
                // treat the key as absent.
                warn!(key = %key, error = %err, "store entry unreadable, dropping");
                let mut state = self.state.lock();
                if let Some(len) = state.index.remove(key) {
                    state.size_bytes = state.size_bytes.saturating_sub(len);
                }
                Ok(None)
            }
        }
    }

    fn put(&self, key: &CacheKey, value: &[u8]) -> Result<(), StoreError> {
        let incoming = value.len() as u64;
        let reserve = {
            let state = self.state.lock();
            let old = state.index.get(key).copied().unwrap_or(0);
            incoming.saturating_sub(old)
        };
        // Make room before the file lands so the budget is never
        // exceeded, even transiently.
        self.evict_to_budget(reserve)?;

        fs::write(self.entry_path(key), value)?;

        let mut state = self.state.lock();
        let old = state.index.insert(key.clone(), incoming);
        state.size_bytes = state.size_bytes.saturating_sub(old.unwrap_or(0)) + incoming;
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(len) = state.index.remove(key) else {
            return Ok(false);
        };
        state.size_bytes = state.size_bytes.saturating_sub(len);
        drop(state);

        let _ = fs::remove_file(self.entry_path(key));
        Ok(true)
    }

    fn remove_with_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        let matches: Vec<CacheKey> = state
            .index
            .keys()
            .filter(|key| key.has_prefix(prefix))
            .cloned()
            .collect();
        for key in &matches {
            if let Some(len) = state.index.remove(key) {
                state.size_bytes = state.size_bytes.saturating_sub(len);
            }
        }
        drop(state);

        for key in &matches {
            let _ = fs::remove_file(self.entry_path(key));
        }

        debug!(prefix, removed = matches.len(), "store prefix removal");
        Ok(matches.len() as u64)
    }

    fn contains(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().index.contains_key(key))
    }

    fn size_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().size_bytes)
    }

    fn entry_count(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().index.len())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let keys: Vec<CacheKey> = state.index.keys().cloned().collect();
        state.index.clear();
        state.size_bytes = 0;
        drop(state);

        for key in keys {
            let _ = fs::remove_file(self.entry_path(&key));
        }
        Ok(())
    }
}

fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

/// Percent-encode a key into a filesystem-safe filename stem.
fn encode_key(key: &CacheKey) -> String {
    let raw = key.as_str();
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if is_plain(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Recover a key from an entry filename; `None` for files this store did
/// not write.
fn decode_entry_filename(path: &Path) -> Option<CacheKey> {
    if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;

    let mut bytes = Vec::with_capacity(stem.len());
    let mut chars = stem.bytes();
    while let Some(byte) = chars.next() {
        if byte == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let pair = [hi, lo];
            let pair = std::str::from_utf8(&pair).ok()?;
            bytes.push(u8::from_str_radix(pair, 16).ok()?);
        } else if is_plain(byte) {
            bytes.push(byte);
        } else {
            return None;
        }
    }

    String::from_utf8(bytes).ok().map(CacheKey::new)
}
