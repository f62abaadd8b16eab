//! A single LRU shard: O(1) get/put/delete with recency ordering.
//!
//! Nodes live in an arena (a flat vector of slots) and are chained into a
//! circular doubly-linked list through stable integer indices, with two
//! sentinel slots bracketing the list. The key map stores `key -> slot`.
//! This gives the classic pointer-based LRU its O(1) splices without any
//! aliasing of owned nodes.
//!
//! A shard is not synchronized; `SegmentedCache` wraps each shard in its own
//! lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Called with `(key, value, dirty)` when an entry leaves the cache through
/// eviction, deletion, or `clear`. Must not re-enter the owning shard.
pub type EvictionHook = Arc<dyn Fn(&[u8], &[u8], bool) + Send + Sync>;

const HEAD: usize = 0;
const TAIL: usize = 1;

struct Slot {
    key: Vec<u8>,
    value: Vec<u8>,
    dirty: bool,
    last_access: Instant,
    prev: usize,
    next: usize,
}

impl Slot {
    fn sentinel() -> Self {
        Self {
            key: Vec::new(),
            value: Vec::new(),
            dirty: false,
            last_access: Instant::now(),
            prev: HEAD,
            next: TAIL,
        }
    }
}

pub struct LruShard {
    capacity: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    map: HashMap<Vec<u8>, usize>,
    hook: Option<EvictionHook>,
}

impl LruShard {
    /// Creates a shard holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity + 2);
        slots.push(Slot::sentinel()); // HEAD
        slots.push(Slot::sentinel()); // TAIL
        slots[HEAD].next = TAIL;
        slots[TAIL].prev = HEAD;
        Self {
            capacity,
            slots,
            free: Vec::new(),
            map: HashMap::new(),
            hook: None,
        }
    }

    pub fn set_eviction_hook(&mut self, hook: Option<EvictionHook>) {
        self.hook = hook;
    }

    /// Returns the value and promotes the entry to most-recently-used.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let idx = *self.map.get(key)?;
        self.slots[idx].last_access = Instant::now();
        self.unlink(idx);
        self.link_front(idx);
        Some(self.slots[idx].value.clone())
    }

    /// Inserts or updates an entry, marking it dirty and most-recently-used.
    /// Evicts from the LRU end until there is room for a new key.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        if let Some(&idx) = self.map.get(key) {
            let slot = &mut self.slots[idx];
            slot.value = value.to_vec();
            slot.dirty = true;
            slot.last_access = Instant::now();
            self.unlink(idx);
            self.link_front(idx);
            return;
        }

        while self.map.len() >= self.capacity {
            self.evict_lru();
        }

        let idx = self.alloc(key.to_vec(), value.to_vec());
        self.link_front(idx);
        self.map.insert(key.to_vec(), idx);
    }

    /// Removes an entry, running the eviction hook with its dirty flag.
    /// Returns whether the key existed.
    pub fn del(&mut self, key: &[u8]) -> bool {
        let Some(idx) = self.map.remove(key) else {
            return false;
        };
        self.unlink(idx);
        self.release(idx);
        true
    }

    /// Membership check without promotion.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.map.keys().cloned().collect()
    }

    /// Snapshot of all dirty `(key, value)` pairs, most-recent first.
    pub fn dirty_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        let mut idx = self.slots[HEAD].next;
        while idx != TAIL {
            let slot = &self.slots[idx];
            if slot.dirty {
                out.push((slot.key.clone(), slot.value.clone()));
            }
            idx = slot.next;
        }
        out
    }

    /// Marks an entry clean after it has been persisted.
    pub fn clear_dirty(&mut self, key: &[u8]) {
        if let Some(&idx) = self.map.get(key) {
            self.slots[idx].dirty = false;
        }
    }

    /// Evicts every entry, running the hook for each.
    pub fn clear(&mut self) {
        while !self.map.is_empty() {
            self.evict_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_lru(&mut self) {
        let idx = self.slots[TAIL].prev;
        if idx == HEAD {
            return;
        }
        self.unlink(idx);
        self.map.remove(&self.slots[idx].key);
        self.release(idx);
    }

    /// Detaches the slot, runs the hook, and returns it to the free list.
    fn release(&mut self, idx: usize) {
        let key = std::mem::take(&mut self.slots[idx].key);
        let value = std::mem::take(&mut self.slots[idx].value);
        let dirty = self.slots[idx].dirty;
        if let Some(hook) = self.hook.clone() {
            hook(&key, &value, dirty);
        }
        self.free.push(idx);
    }

    fn alloc(&mut self, key: Vec<u8>, value: Vec<u8>) -> usize {
        let now = Instant::now();
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx];
            slot.key = key;
            slot.value = value;
            slot.dirty = true;
            slot.last_access = now;
            idx
        } else {
            self.slots.push(Slot {
                key,
                value,
                dirty: true,
                last_access: now,
                prev: HEAD,
                next: TAIL,
            });
            self.slots.len() - 1
        }
    }

    fn link_front(&mut self, idx: usize) {
        let first = self.slots[HEAD].next;
        self.slots[idx].prev = HEAD;
        self.slots[idx].next = first;
        self.slots[first].prev = idx;
        self.slots[HEAD].next = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.slots[idx].prev;
        let next = self.slots[idx].next;
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }
}
