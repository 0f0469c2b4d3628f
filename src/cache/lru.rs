//! Arena-based LRU cache.
//!
//! Entries live in a slab (`Vec` of slots, recycled through a free list);
//! the recency list threads through them with `prev`/`next` stored as slot
//! indices instead of references, so there are no ownership cycles and
//! splicing stays O(1). A `HashMap` from key to slot index gives O(1)
//! lookup. `head` is the most-recently-used end, `tail` the least.
//!
//! The cache is deliberately unsynchronized: the map and list must always
//! be mutated together, so callers wrap the whole cache in one lock rather
//! than locking the pieces separately.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::cache::types::CacheError;

/// Sentinel index meaning "no slot".
const NIL: usize = usize::MAX;

/// Callback invoked for entries removed by capacity pressure or resize.
pub type EvictionCallback<K, V> = Box<dyn FnMut(&K, &V) + Send>;

struct Slot<K, V> {
    key: K,
    value: V,
    cost: u64,
    pinned: bool,
    prev: usize,
    next: usize,
}

/// Fixed-capacity LRU cache with pluggable entry cost.
///
/// Capacity and sizes are in cost units: with the default unit cost the
/// capacity is an entry count; with a byte cost it is a byte budget.
/// Pinned entries are never evicted by capacity pressure, only removed
/// explicitly.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: u64,
    size: u64,
    pinned_size: u64,
    cost_fn: fn(&V) -> u64,
    eviction_cb: Option<EvictionCallback<K, V>>,
}

fn unit_cost<V>(_: &V) -> u64 {
    1
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Cache holding up to `capacity` entries (unit cost).
    pub fn new(capacity: u64) -> Self {
        Self::with_cost(capacity, unit_cost::<V>)
    }

    /// Cache with a custom cost per entry; `capacity` is the cost budget.
    pub fn with_cost(capacity: u64, cost_fn: fn(&V) -> u64) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
            size: 0,
            pinned_size: 0,
            cost_fn,
            eviction_cb: None,
        }
    }

    /// Register a callback for capacity- and resize-driven evictions.
    ///
    /// Not invoked for explicit [`remove`](Self::remove) or
    /// [`clear`](Self::clear).
    pub fn set_eviction_callback(&mut self, callback: EvictionCallback<K, V>) {
        self.eviction_cb = Some(callback);
    }

    /// Insert or update an entry and promote it to most-recently-used.
    ///
    /// Evicts least-recently-used unpinned entries first so the insert
    /// never takes the cache over capacity. Returns the previous value on
    /// update. Fails with [`CacheError::CapacityRefused`] when the entry
    /// alone exceeds capacity or only pinned entries could be evicted; the
    /// cache is left unchanged in that case.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, CacheError> {
        let cost = (self.cost_fn)(&value);
        if cost > self.capacity {
            return Err(CacheError::CapacityRefused {
                cost,
                capacity: self.capacity,
            });
        }

        let existing = self.map.get(&key).copied();

        // Feasibility before touching anything: the entries that cannot be
        // evicted are the pinned ones plus the entry being written itself.
        let immovable = match existing {
            Some(idx) if self.slot(idx).pinned => self.pinned_size - self.slot(idx).cost + cost,
            _ => self.pinned_size + cost,
        };
        if immovable > self.capacity {
            return Err(CacheError::CapacityRefused {
                cost,
                capacity: self.capacity,
            });
        }

        let freed = existing.map(|idx| self.slot(idx).cost).unwrap_or(0);
        while self.size - freed + cost > self.capacity {
            if !self.evict_one(existing) {
                // Unreachable given the feasibility check, but never loop.
                return Err(CacheError::CapacityRefused {
                    cost,
                    capacity: self.capacity,
                });
            }
        }

        match existing {
            Some(idx) => {
                let slot = self.slot_mut(idx);
                let old_cost = slot.cost;
                let old_value = std::mem::replace(&mut slot.value, value);
                slot.cost = cost;
                if slot.pinned {
                    self.pinned_size = self.pinned_size - old_cost + cost;
                }
                self.size = self.size - old_cost + cost;
                self.promote(idx);
                Ok(Some(old_value))
            }
            None => {
                let idx = self.alloc(Slot {
                    key: key.clone(),
                    value,
                    cost,
                    pinned: false,
                    prev: NIL,
                    next: NIL,
                });
                self.map.insert(key, idx);
                self.push_front(idx);
                self.size += cost;
                Ok(None)
            }
        }
    }

    /// Look up a value and promote it to most-recently-used.
    pub fn find(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.promote(idx);
        Some(&self.slot(idx).value)
    }

    /// Look up a value without touching recency order.
    pub fn find_no_promote(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        Some(&self.slot(idx).value)
    }

    /// Remove an entry, returning its value. No eviction callback.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.detach(idx);
        let slot = self.take_slot(idx);
        self.size -= slot.cost;
        if slot.pinned {
            self.pinned_size -= slot.cost;
        }
        Some(slot.value)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Mark or unmark an entry as non-evictable. Returns `false` if the
    /// key is absent.
    pub fn pin(&mut self, key: &K, pinned: bool) -> bool {
        let Some(&idx) = self.map.get(key) else {
            return false;
        };
        let slot = self.slot_mut(idx);
        if slot.pinned != pinned {
            let cost = slot.cost;
            slot.pinned = pinned;
            if pinned {
                self.pinned_size += cost;
            } else {
                self.pinned_size -= cost;
            }
        }
        true
    }

    /// Whether an entry is pinned; `None` if the key is absent.
    pub fn is_pinned(&self, key: &K) -> Option<bool> {
        let idx = *self.map.get(key)?;
        Some(self.slot(idx).pinned)
    }

    /// Change the capacity, evicting from the least-recently-used end
    /// until the new budget is met. Pinned entries are never evicted, so
    /// the resulting size may exceed the requested capacity.
    pub fn resize(&mut self, new_capacity: u64) {
        self.capacity = new_capacity;
        while self.size > self.capacity {
            if !self.evict_one(None) {
                break;
            }
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Current size in cost units.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Capacity in cost units.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Drop every entry. No eviction callbacks.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.size = 0;
        self.pinned_size = 0;
    }

    /// The least-recently-used entry, if any.
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.slot(self.tail);
        Some((&slot.key, &slot.value))
    }

    /// Iterate from most- to least-recently used without promoting.
    pub fn iter(&self) -> LruIter<'_, K, V> {
        LruIter {
            cache: self,
            cursor: self.head,
            toward_lru: true,
        }
    }

    /// Iterate from least- to most-recently used without promoting.
    pub fn iter_lru(&self) -> LruIter<'_, K, V> {
        LruIter {
            cache: self,
            cursor: self.tail,
            toward_lru: false,
        }
    }

    // ── arena plumbing ──────────────────────────────────────────────────

    fn slot(&self, idx: usize) -> &Slot<K, V> {
        self.slots[idx].as_ref().expect("linked slot is vacant")
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<K, V> {
        self.slots[idx].as_mut().expect("linked slot is vacant")
    }

    fn take_slot(&mut self, idx: usize) -> Slot<K, V> {
        self.free.push(idx);
        self.slots[idx].take().expect("linked slot is vacant")
    }

    fn alloc(&mut self, slot: Slot<K, V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slot(idx);
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slot_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slot_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slot_mut(idx);
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slot_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    /// Evict the least-recently-used unpinned entry, skipping `keep`.
    /// Returns `false` when no candidate exists.
    fn evict_one(&mut self, keep: Option<usize>) -> bool {
        let mut cursor = self.tail;
        while cursor != NIL {
            let slot = self.slot(cursor);
            if !slot.pinned && Some(cursor) != keep {
                break;
            }
            cursor = slot.prev;
        }
        if cursor == NIL {
            return false;
        }

        self.detach(cursor);
        let slot = self.take_slot(cursor);
        self.map.remove(&slot.key);
        self.size -= slot.cost;
        if let Some(cb) = self.eviction_cb.as_mut() {
            cb(&slot.key, &slot.value);
        }
        true
    }
}

impl<K, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.map.len())
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("pinned_size", &self.pinned_size)
            .finish()
    }
}

/// Recency-order iterator over `(key, value)` pairs.
pub struct LruIter<'a, K, V> {
    cache: &'a LruCache<K, V>,
    cursor: usize,
    toward_lru: bool,
}

impl<'a, K: Eq + Hash + Clone, V> Iterator for LruIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let slot = self.cache.slot(self.cursor);
        self.cursor = if self.toward_lru { slot.next } else { slot.prev };
        Some((&slot.key, &slot.value))
    }
}
