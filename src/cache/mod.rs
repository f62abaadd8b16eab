//! Segmented LRU cache with per-segment locking.
//!
//! The key space fans out over a fixed number of independent LRU shards, each
//! behind its own mutex, so operations on keys in different segments never
//! contend. Bulk operations (`size`, `keys`, `dirty_entries`, `clear`) visit
//! one segment lock at a time and make no cross-segment atomicity promise.

pub mod lru;

use std::sync::Mutex;

use lru::{EvictionHook, LruShard};

/// The shard for a key is chosen by a stable hash, so placement survives
/// restarts and does not depend on process-randomized hashers.
fn fnv1a(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in key {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub struct SegmentedCache {
    segments: Vec<Mutex<LruShard>>,
}

impl SegmentedCache {
    /// Creates a cache of `segments` shards sharing `total_capacity` entries.
    /// Each shard gets `total_capacity / segments`, minimum 1.
    pub fn new(total_capacity: usize, segments: usize) -> Self {
        assert!(segments > 0, "segments must be > 0");
        let per_segment = (total_capacity / segments).max(1);
        let segments = (0..segments)
            .map(|_| Mutex::new(LruShard::new(per_segment)))
            .collect();
        Self { segments }
    }

    fn segment_for(&self, key: &[u8]) -> &Mutex<LruShard> {
        let idx = (fnv1a(key) % self.segments.len() as u64) as usize;
        &self.segments[idx]
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.segment_for(key).lock().unwrap().get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.segment_for(key).lock().unwrap().put(key, value)
    }

    pub fn del(&self, key: &[u8]) -> bool {
        self.segment_for(key).lock().unwrap().del(key)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.segment_for(key).lock().unwrap().exists(key)
    }

    pub fn clear_dirty(&self, key: &[u8]) {
        self.segment_for(key).lock().unwrap().clear_dirty(key)
    }

    /// Total entries across all segments.
    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut all = Vec::new();
        for segment in &self.segments {
            all.extend(segment.lock().unwrap().keys());
        }
        all
    }

    /// All dirty `(key, value)` pairs, collected one segment at a time.
    pub fn dirty_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut all = Vec::new();
        for segment in &self.segments {
            all.extend(segment.lock().unwrap().dirty_entries());
        }
        all
    }

    /// Installs the eviction hook on every segment.
    pub fn set_eviction_hook(&self, hook: EvictionHook) {
        for segment in &self.segments {
            segment.lock().unwrap().set_eviction_hook(Some(hook.clone()));
        }
    }

    /// Evicts every entry in every segment, running hooks per eviction.
    pub fn clear(&self) {
        for segment in &self.segments {
            segment.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_put_get_across_segments() {
        let cache = SegmentedCache::new(1024, 32);
        for i in 0..200u32 {
            let key = format!("key_{i}");
            let value = format!("value_{i}");
            cache.put(key.as_bytes(), value.as_bytes());
        }
        for i in 0..200u32 {
            let key = format!("key_{i}");
            let value = format!("value_{i}");
            assert_eq!(cache.get(key.as_bytes()), Some(value.into_bytes()));
        }
        assert_eq!(cache.size(), 200);
    }

    #[test]
    fn test_key_lives_in_one_segment() {
        let cache = SegmentedCache::new(64, 8);
        cache.put(b"k", b"v");
        cache.del(b"k");
        assert_eq!(cache.size(), 0);
        assert!(!cache.exists(b"k"));
    }

    #[test]
    fn test_dirty_entries_aggregate() {
        let cache = SegmentedCache::new(256, 4);
        cache.put(b"a", b"1");
        cache.put(b"b", b"2");
        cache.put(b"c", b"3");
        cache.clear_dirty(b"b");

        let mut dirty = cache.dirty_entries();
        dirty.sort();
        assert_eq!(dirty, vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]);
    }

    #[test]
    fn test_clear_runs_hook_everywhere() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let sink = evictions.clone();

        let cache = SegmentedCache::new(256, 8);
        cache.set_eviction_hook(Arc::new(move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        for i in 0..50u32 {
            cache.put(format!("k{i}").as_bytes(), b"v");
        }
        cache.clear();

        assert_eq!(cache.size(), 0);
        assert_eq!(evictions.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_concurrent_writers_on_disjoint_keys() {
        let cache = Arc::new(SegmentedCache::new(4096, 32));
        let mut handles = Vec::new();

        for t in 0..4 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    let key = format!("t{t}_key{i}");
                    cache.put(key.as_bytes(), b"v");
                    assert!(cache.exists(key.as_bytes()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.size(), 2000);
    }

    #[test]
    fn test_single_segment_degenerates_to_plain_lru() {
        // capacity 3, one segment
        let cache = SegmentedCache::new(3, 1);
        cache.put(b"a", b"1");
        cache.put(b"b", b"2");
        cache.put(b"c", b"3");
        assert!(cache.get(b"a").is_some());
        cache.put(b"d", b"4");

        assert!(!cache.exists(b"b"));
        assert!(cache.exists(b"a"));
        assert!(cache.exists(b"c"));
        assert!(cache.exists(b"d"));
    }
}
