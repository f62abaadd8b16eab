//! In-memory sorted buffer of recent writes.
//!
//! Entries are keyed by [`InternalKey`]: user key ascending, then sequence
//! descending, so the newest version of a key is the first one an ordered
//! scan meets. Deletes are soft — a tombstone entry shadows every older
//! version until compaction drops it at the deepest level.
//!
//! The backing structure is `crossbeam_skiplist::SkipMap`, which supports
//! lock-free concurrent reads; the engine serializes writers externally.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crossbeam_skiplist::SkipMap;

/// Fixed per-entry overhead charged to the approximate size, covering key
/// ordering metadata and skip-list node costs.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Value = 0x01,
    Deletion = 0x02,
}

impl ValueKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ValueKind::Value),
            0x02 => Some(ValueKind::Deletion),
            _ => None,
        }
    }
}

/// Versioned key: `user_key` ascending, then `sequence` descending, so the
/// record with the largest sequence for a user key sorts first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub sequence: u64,
    pub kind: ValueKind,
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| (self.kind as u8).cmp(&(other.kind as u8)))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of a point lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Newest record is a live value.
    Value(Vec<u8>),
    /// Newest record is a tombstone: the key is deleted, do not fall through
    /// to older sources.
    Tombstone,
}

pub struct Memtable {
    data: SkipMap<InternalKey, Vec<u8>>,
    approx_size: AtomicUsize,
    entries: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            approx_size: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8], sequence: u64) {
        let ikey = InternalKey {
            user_key: key.to_vec(),
            sequence,
            kind: ValueKind::Value,
        };
        self.data.insert(ikey, value.to_vec());
        self.approx_size
            .fetch_add(key.len() + value.len() + ENTRY_OVERHEAD, AtomicOrdering::SeqCst);
        self.entries.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub fn delete(&self, key: &[u8], sequence: u64) {
        let ikey = InternalKey {
            user_key: key.to_vec(),
            sequence,
            kind: ValueKind::Deletion,
        };
        self.data.insert(ikey, Vec::new());
        self.approx_size
            .fetch_add(key.len() + ENTRY_OVERHEAD, AtomicOrdering::SeqCst);
        self.entries.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Returns the newest record for `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<Lookup> {
        // With sequence ordered descending, this probe sorts before every
        // real record of the same user key.
        let probe = InternalKey {
            user_key: key.to_vec(),
            sequence: u64::MAX,
            kind: ValueKind::Value,
        };
        let entry = self.data.range(probe..).next()?;
        if entry.key().user_key != key {
            return None;
        }
        match entry.key().kind {
            ValueKind::Value => Some(Lookup::Value(entry.value().clone())),
            ValueKind::Deletion => Some(Lookup::Tombstone),
        }
    }

    pub fn approximate_size(&self) -> usize {
        self.approx_size.load(AtomicOrdering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.load(AtomicOrdering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    pub fn should_flush(&self, write_buffer_size: usize) -> bool {
        self.approximate_size() >= write_buffer_size
    }

    /// Walks all entries in internal-key order.
    pub fn for_each<F: FnMut(&InternalKey, &[u8])>(&self, mut cb: F) {
        for entry in self.data.iter() {
            cb(entry.key(), entry.value());
        }
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_sequence_wins() {
        let mem = Memtable::new();
        mem.put(b"k", b"old", 1);
        mem.put(b"k", b"new", 2);

        assert_eq!(mem.get(b"k"), Some(Lookup::Value(b"new".to_vec())));
        assert_eq!(mem.entry_count(), 2);
    }

    #[test]
    fn test_tombstone_shadows_value() {
        let mem = Memtable::new();
        mem.put(b"k", b"v", 1);
        mem.delete(b"k", 2);
        assert_eq!(mem.get(b"k"), Some(Lookup::Tombstone));

        // A later put resurrects the key.
        mem.put(b"k", b"v2", 3);
        assert_eq!(mem.get(b"k"), Some(Lookup::Value(b"v2".to_vec())));
    }

    #[test]
    fn test_absent_key_is_none() {
        let mem = Memtable::new();
        mem.put(b"a", b"1", 1);
        assert_eq!(mem.get(b"b"), None);
        // Prefix of a stored key must not match.
        mem.put(b"abc", b"2", 2);
        assert_eq!(mem.get(b"ab"), None);
    }

    #[test]
    fn test_iteration_order() {
        let mem = Memtable::new();
        mem.put(b"b", b"1", 10);
        mem.put(b"a", b"2", 11);
        mem.put(b"b", b"3", 12);
        mem.delete(b"c", 13);

        let mut seen = Vec::new();
        mem.for_each(|ikey, _| seen.push((ikey.user_key.clone(), ikey.sequence, ikey.kind)));

        assert_eq!(seen, vec![
            (b"a".to_vec(), 11, ValueKind::Value),
            (b"b".to_vec(), 12, ValueKind::Value), // newest sequence first
            (b"b".to_vec(), 10, ValueKind::Value),
            (b"c".to_vec(), 13, ValueKind::Deletion),
        ]);
    }

    #[test]
    fn test_size_accounting_triggers_flush() {
        let mem = Memtable::new();
        assert!(!mem.should_flush(1024));

        mem.put(b"key", &[0u8; 512], 1);
        mem.put(b"key2", &[0u8; 512], 2);
        assert!(mem.should_flush(1024));
        assert!(mem.approximate_size() >= 1024 + 2 * ENTRY_OVERHEAD);
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        use std::sync::Arc;

        let mem = Arc::new(Memtable::new());
        let writer = {
            let mem = mem.clone();
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    mem.put(format!("k{i}").as_bytes(), b"v", i);
                }
            })
        };
        let reader = {
            let mem = mem.clone();
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    // Whatever is visible must be well-formed.
                    if let Some(Lookup::Value(v)) = mem.get(format!("k{i}").as_bytes()) {
                        assert_eq!(v, b"v");
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(mem.entry_count(), 1000);
    }
}
