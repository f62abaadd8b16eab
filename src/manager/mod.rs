//! Cache manager: the sync layer between the segmented cache and the
//! storage backend.
//!
//! Three workflows:
//!
//! - **Read (cache-aside)**: check the cache; on miss, load from the backend
//!   and backfill the cache clean.
//! - **Write-through**: update the cache, then synchronously persist to the
//!   backend before acknowledging.
//! - **Write-back**: update the cache and acknowledge immediately; the
//!   periodic worker batches dirty entries to the backend, and the eviction
//!   hook persists dirty evictees synchronously.

pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::cache::SegmentedCache;
use crate::error::Result;

/// How PUTs reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Persist synchronously before acknowledging.
    WriteThrough,
    /// Acknowledge after the cache update; persistence is deferred.
    WriteBack,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::WriteThrough => "write-through",
            WriteMode::WriteBack => "write-back",
        }
    }
}

/// Write-back flushes go to the backend in batches of at most this many
/// entries, bounding peak memory during a large flush.
const FLUSH_BATCH_LIMIT: usize = 5000;

#[derive(Debug, Default)]
pub struct ManagerStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub write_through_ops: AtomicU64,
    pub write_back_ops: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct ManagerStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub write_through_ops: u64,
    pub write_back_ops: u64,
}

impl ManagerStats {
    pub fn snapshot(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            cache_misses: self.cache_misses.load(Ordering::SeqCst),
            write_through_ops: self.write_through_ops.load(Ordering::SeqCst),
            write_back_ops: self.write_back_ops.load(Ordering::SeqCst),
        }
    }
}

pub struct CacheManager {
    cache: Arc<SegmentedCache>,
    backend: Arc<dyn StorageBackend>,
    mode: WriteMode,
    stats: ManagerStats,
}

impl CacheManager {
    pub fn new(
        cache_capacity: usize,
        segments: usize,
        mode: WriteMode,
        backend: Arc<dyn StorageBackend>,
    ) -> Arc<Self> {
        let cache = Arc::new(SegmentedCache::new(cache_capacity, segments));

        // Dirty evictees are persisted synchronously. The hook cannot fail
        // from the cache's point of view; a backend error here is logged and
        // the write is lost from the cache layer.
        let hook_backend = backend.clone();
        cache.set_eviction_hook(Arc::new(move |key: &[u8], value: &[u8], dirty: bool| {
            if dirty {
                if let Err(e) = hook_backend.store(key, value) {
                    tracing::error!(error = %e, "Failed to persist dirty evictee");
                }
            }
        }));

        Arc::new(Self {
            cache,
            backend,
            mode,
            stats: ManagerStats::default(),
        })
    }

    /// Cache-aside read.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.cache.get(key) {
            self.stats.cache_hits.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(value));
        }
        self.stats.cache_misses.fetch_add(1, Ordering::SeqCst);

        let Some(value) = self.backend.load(key)? else {
            return Ok(None);
        };
        // Backfill clean: the value just came from the backend.
        self.cache.put(key, &value);
        self.cache.clear_dirty(key);
        Ok(Some(value))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.mode {
            WriteMode::WriteThrough => {
                self.cache.put(key, value);
                // On backend failure the entry stays dirty in the cache and
                // the error goes to the caller; no rollback.
                self.backend.store(key, value)?;
                self.cache.clear_dirty(key);
                self.stats.write_through_ops.fetch_add(1, Ordering::SeqCst);
            }
            WriteMode::WriteBack => {
                self.cache.put(key, value);
                self.stats.write_back_ops.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Deletes from cache and backend. Returns whether the key was present
    /// in the cache (the count DEL reports is cache-local).
    pub fn del(&self, key: &[u8]) -> Result<bool> {
        let existed = self.cache.del(key);
        self.backend.remove(key)?;
        Ok(existed)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.cache.exists(key)
    }

    pub fn size(&self) -> usize {
        self.cache.size()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.cache.keys()
    }

    /// Empties the cache. Dirty entries are persisted through the eviction
    /// hook on the way out; durable state on disk is untouched.
    pub fn flush_all(&self) {
        self.cache.clear();
    }

    /// Persists all dirty entries in bounded batches, clearing each entry's
    /// dirty flag once its batch lands. A failed batch aborts the pass; the
    /// remaining entries stay dirty for the next one.
    pub fn flush_dirty(&self) -> Result<usize> {
        let dirty = self.cache.dirty_entries();
        if dirty.is_empty() {
            return Ok(0);
        }

        let total = dirty.len();
        for batch in dirty.chunks(FLUSH_BATCH_LIMIT) {
            self.backend.batch_store(batch)?;
            for (key, _) in batch {
                self.cache.clear_dirty(key);
            }
        }
        tracing::debug!(entries = total, "Flushed dirty cache entries");
        Ok(total)
    }

    /// Final drain: flush remaining dirty entries, then clear the cache so
    /// the eviction hook catches anything a failed flush left behind.
    pub fn shutdown(&self) {
        if let Err(e) = self.flush_dirty() {
            tracing::error!(error = %e, "Final dirty flush failed; eviction hook will retry");
        }
        self.cache.clear();
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    pub fn write_mode(&self) -> WriteMode {
        self.mode
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }
}
