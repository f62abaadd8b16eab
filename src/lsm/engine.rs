//! The LSM storage engine.
//!
//! Orchestrates the WAL, memtables and SSTables into one `StorageBackend`:
//!
//! - Write path: allocate a sequence, append to the WAL, insert into the
//!   active memtable. When the memtable passes its size threshold it is
//!   frozen into the immutable slot and the WAL is rotated; the maintenance
//!   task flushes the frozen memtable to a new L0 table and retires the
//!   rotated WAL segments.
//! - Read path: active memtable, then the immutable memtable, then SSTables
//!   newest-first (L0 in reverse registration order, then L1, L2, ...). A
//!   tombstone anywhere along the way is an authoritative miss.
//! - Compaction: when L0 accumulates `l0_compact_trigger` tables, all of L0
//!   and L1 merge into one new L1 table. The newest record per key wins;
//!   tombstones are carried forward and only dropped once they reach the
//!   deepest level.
//!
//! Writers are serialized on a single write lock, which keeps sequence
//! order, WAL order and memtable visibility in agreement. Readers never take
//! the write lock.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use itertools::Itertools;

use super::memtable::{Lookup, Memtable, ValueKind};
use super::sstable::{SsTable, SsTableWriter, TableEntry};
use super::wal::{WalReader, WalRecord, WalRecordKind, WalWriter};
use crate::backend::StorageBackend;
use crate::config::LsmConfig;
use crate::error::Result;
use crate::tasks::BackgroundTask;

const CURRENT_WAL: &str = "current.wal";

/// Writers stall once the active memtable grows past this multiple of the
/// configured write buffer while a flush is still pending.
const STALL_MULTIPLIER: usize = 4;

#[derive(Debug, Default)]
pub struct LsmStats {
    pub wal_bytes: AtomicU64,
    pub memtable_size: AtomicU64,
    pub memtable_entries: AtomicU64,
    pub sstable_count: AtomicU64,
    pub compactions_done: AtomicU64,
    pub total_puts: AtomicU64,
    pub total_gets: AtomicU64,
    pub total_deletes: AtomicU64,
    pub sstable_hits: AtomicU64,
    pub write_stalls: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct LsmStatsSnapshot {
    pub wal_bytes: u64,
    pub memtable_size: u64,
    pub memtable_entries: u64,
    pub sstable_count: u64,
    pub compactions_done: u64,
    pub total_puts: u64,
    pub total_gets: u64,
    pub total_deletes: u64,
    pub sstable_hits: u64,
    pub write_stalls: u64,
}

impl LsmStats {
    pub fn snapshot(&self) -> LsmStatsSnapshot {
        LsmStatsSnapshot {
            wal_bytes: self.wal_bytes.load(Ordering::SeqCst),
            memtable_size: self.memtable_size.load(Ordering::SeqCst),
            memtable_entries: self.memtable_entries.load(Ordering::SeqCst),
            sstable_count: self.sstable_count.load(Ordering::SeqCst),
            compactions_done: self.compactions_done.load(Ordering::SeqCst),
            total_puts: self.total_puts.load(Ordering::SeqCst),
            total_gets: self.total_gets.load(Ordering::SeqCst),
            total_deletes: self.total_deletes.load(Ordering::SeqCst),
            sstable_hits: self.sstable_hits.load(Ordering::SeqCst),
            write_stalls: self.write_stalls.load(Ordering::SeqCst),
        }
    }
}

pub struct LsmEngine {
    config: LsmConfig,

    sequence: AtomicU64,
    sstable_counter: AtomicU64,

    /// Serializes the write path: sequence allocation, WAL append and
    /// memtable insert happen under this lock, so a record is never visible
    /// to readers before its WAL append completed.
    write_mu: Mutex<()>,

    active: RwLock<Arc<Memtable>>,
    immutable: Mutex<Option<Arc<Memtable>>>,
    wal: RwLock<WalWriter>,
    levels: RwLock<Vec<Vec<Arc<SsTable>>>>,

    flush_pending: AtomicBool,
    closed: AtomicBool,
    stats: LsmStats,
}

impl LsmEngine {
    pub fn open(config: LsmConfig) -> Result<Self> {
        fs::create_dir_all(config.dir.join("wal"))?;
        for level in 0..config.max_levels {
            fs::create_dir_all(config.dir.join("sst").join(format!("L{level}")))?;
        }

        let active = Memtable::new();
        let mut next_seq = 0u64;

        // Rotated segments hold writes that were frozen but never flushed
        // before the last shutdown; replay them oldest-first, then the
        // current log.
        let rotated = Self::rotated_wal_paths(&config.dir)?;
        for path in &rotated {
            let replayed = WalReader::open(path)?.replay(|rec| {
                Self::apply_wal_record(&active, &rec);
                next_seq = next_seq.max(rec.sequence + 1);
            })?;
            tracing::info!(path = %path.display(), records = replayed, "Replayed rotated WAL segment");
        }

        let current = config.dir.join("wal").join(CURRENT_WAL);
        if current.exists() {
            let replayed = WalReader::open(&current)?.replay(|rec| {
                Self::apply_wal_record(&active, &rec);
                next_seq = next_seq.max(rec.sequence + 1);
            })?;
            if replayed > 0 {
                tracing::info!(records = replayed, "Recovered memtable from WAL");
            }
        }
        let wal = WalWriter::open(&current)?;

        let mut levels: Vec<Vec<Arc<SsTable>>> = vec![Vec::new(); config.max_levels];
        let mut next_table_id = 0u64;
        for (level, tables) in levels.iter_mut().enumerate() {
            let dir = config.dir.join("sst").join(format!("L{level}"));
            let mut found: Vec<(u64, Arc<SsTable>)> = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let Some(id) = Self::parse_table_id(&path) else {
                    continue;
                };
                match SsTable::open(&path) {
                    Ok(table) => {
                        next_table_id = next_table_id.max(id + 1);
                        found.push((id, Arc::new(table)));
                    }
                    Err(e) => {
                        // Incomplete table from a crash mid-flush; the WAL
                        // still covers its contents.
                        tracing::warn!(path = %path.display(), error = %e, "Removing invalid SSTable");
                        let _ = fs::remove_file(&path);
                    }
                }
            }
            found.sort_by_key(|(id, _)| *id);
            *tables = found.into_iter().map(|(_, table)| table).collect();
        }

        let engine = Self {
            config,
            sequence: AtomicU64::new(next_seq),
            sstable_counter: AtomicU64::new(next_table_id),
            write_mu: Mutex::new(()),
            active: RwLock::new(Arc::new(active)),
            immutable: Mutex::new(None),
            wal: RwLock::new(wal),
            levels: RwLock::new(levels),
            flush_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: LsmStats::default(),
        };
        engine.refresh_gauges();

        // Data recovered from rotated segments is durable only in those
        // files; persist it to an SSTable so they can be retired.
        if !rotated.is_empty() {
            engine.force_flush()?;
            engine.cleanup_rotated_wals();
        }

        Ok(engine)
    }

    pub fn stats(&self) -> &LsmStats {
        &self.stats
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _write = self.write_mu.lock()?;
        self.stall_if_full()?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.wal.read()?.append(&WalRecord::put(seq, key.to_vec(), value.to_vec()))?;
        self.active.read()?.put(key, value, seq);

        self.stats.total_puts.fetch_add(1, Ordering::SeqCst);
        self.refresh_gauges();
        self.maybe_freeze()
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let _write = self.write_mu.lock()?;
        self.stall_if_full()?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.wal.read()?.append(&WalRecord::delete(seq, key.to_vec()))?;
        self.active.read()?.delete(key, seq);

        self.stats.total_deletes.fetch_add(1, Ordering::SeqCst);
        self.refresh_gauges();
        self.maybe_freeze()
    }

    pub fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let _write = self.write_mu.lock()?;
        self.stall_if_full()?;

        let records: Vec<WalRecord> = entries
            .iter()
            .map(|(key, value)| {
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                WalRecord::put(seq, key.clone(), value.clone())
            })
            .collect();
        self.wal.read()?.append_batch(&records)?;

        let active = self.active.read()?;
        for record in &records {
            active.put(&record.key, &record.value, record.sequence);
        }
        drop(active);

        self.stats.total_puts.fetch_add(entries.len() as u64, Ordering::SeqCst);
        self.refresh_gauges();
        self.maybe_freeze()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.stats.total_gets.fetch_add(1, Ordering::SeqCst);

        match self.active.read()?.get(key) {
            Some(Lookup::Value(value)) => return Ok(Some(value)),
            Some(Lookup::Tombstone) => return Ok(None),
            None => {}
        }

        let immutable = self.immutable.lock()?.clone();
        if let Some(mem) = immutable {
            match mem.get(key) {
                Some(Lookup::Value(value)) => return Ok(Some(value)),
                Some(Lookup::Tombstone) => return Ok(None),
                None => {}
            }
        }

        let levels = self.levels.read()?;
        for tables in levels.iter() {
            for table in tables.iter().rev() {
                match table.get(key)? {
                    Some(TableEntry::Value(value)) => {
                        self.stats.sstable_hits.fetch_add(1, Ordering::SeqCst);
                        return Ok(Some(value));
                    }
                    Some(TableEntry::Tombstone) => return Ok(None),
                    None => {}
                }
            }
        }
        Ok(None)
    }

    /// Flushes buffered WAL frames to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.wal.read()?.sync()
    }

    /// Flushes the immutable memtable to a new L0 table, if one is pending.
    /// Returns whether a table was written. On failure the immutable
    /// memtable is kept and the flush retried on the next maintenance tick.
    pub fn flush(&self) -> Result<bool> {
        let Some(mem) = self.immutable.lock()?.clone() else {
            self.flush_pending.store(false, Ordering::SeqCst);
            return Ok(false);
        };

        let id = self.sstable_counter.fetch_add(1, Ordering::SeqCst);
        let path = self.level_dir(0).join(format!("sst_{id}.sst"));
        let mut writer = SsTableWriter::create(&path);

        // Emit only the newest record per user key. Tombstones are written
        // out too; an older table may still hold the key.
        let mut last_key: Option<Vec<u8>> = None;
        mem.for_each(|ikey, value| {
            if last_key.as_deref() == Some(ikey.user_key.as_slice()) {
                return;
            }
            last_key = Some(ikey.user_key.clone());
            match ikey.kind {
                ValueKind::Value => writer.add(&ikey.user_key, value),
                ValueKind::Deletion => writer.add_tombstone(&ikey.user_key),
            }
        });
        let entries = writer.entry_count();

        if let Err(e) = writer.finish() {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        let table = Arc::new(SsTable::open(&path)?);

        self.levels.write()?[0].push(table);
        *self.immutable.lock()? = None;
        self.flush_pending.store(false, Ordering::SeqCst);
        self.cleanup_rotated_wals();
        self.refresh_gauges();

        tracing::info!(table_id = id, entries, "Flushed memtable to L0");
        Ok(true)
    }

    /// Freezes the active memtable (regardless of size) and flushes every
    /// pending memtable. Used at shutdown and by tests.
    pub fn force_flush(&self) -> Result<()> {
        loop {
            {
                let _write = self.write_mu.lock()?;
                self.freeze_active()?;
            }
            if !self.flush()? {
                return Ok(());
            }
        }
    }

    pub fn flush_is_pending(&self) -> bool {
        self.flush_pending.load(Ordering::SeqCst)
    }

    pub fn needs_compaction(&self) -> bool {
        self.levels
            .read()
            .map(|levels| levels[0].len() >= self.config.l0_compact_trigger)
            .unwrap_or(false)
    }

    /// Merges all of L0 and L1 into a single new L1 table when the L0
    /// trigger is met. Returns whether a compaction ran.
    pub fn compact(&self) -> Result<bool> {
        if !self.needs_compaction() {
            return Ok(false);
        }
        self.merge_level0()
    }

    /// Compacts L0 into L1 regardless of the trigger (tests, admin).
    pub fn force_compaction(&self) -> Result<()> {
        self.force_flush()?;
        self.merge_level0()?;
        Ok(())
    }

    /// Number of tables per level.
    pub fn table_counts(&self) -> Vec<usize> {
        self.levels
            .read()
            .map(|levels| levels.iter().map(|tables| tables.len()).collect())
            .unwrap_or_default()
    }

    /// Flushes everything and syncs the WAL. Further writes are rejected by
    /// `ping` only; the engine itself stays readable.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.force_flush()?;
        self.sync()?;
        tracing::info!("LSM engine closed");
        Ok(())
    }

    fn merge_level0(&self) -> Result<bool> {
        if self.config.max_levels < 2 {
            return Ok(false);
        }
        let (l0, l1) = {
            let levels = self.levels.read()?;
            (levels[0].clone(), levels[1].clone())
        };
        if l0.is_empty() {
            return Ok(false);
        }

        // Older sources first: the L1 accumulation, then L0 tables in
        // registration order. Rank grows with recency so the newest record
        // wins the merge.
        let inputs: Vec<Arc<SsTable>> = l1.iter().chain(l0.iter()).cloned().collect();

        let out_level = 1;
        let drop_tombstones = out_level == self.config.max_levels - 1;

        let id = self.sstable_counter.fetch_add(1, Ordering::SeqCst);
        let path = self.level_dir(out_level).join(format!("sst_{id}.sst"));
        let mut writer = SsTableWriter::create(&path);

        let merged = inputs
            .iter()
            .enumerate()
            .map(|(rank, table)| {
                let table = table.clone();
                table
                    .keys_sorted()
                    .into_iter()
                    .map(move |key| (key, rank, table.clone()))
            })
            .kmerge_by(|a, b| a.0 < b.0 || (a.0 == b.0 && a.1 > b.1))
            .dedup_by(|a, b| a.0 == b.0);

        for (key, _, table) in merged {
            match table.get(&key)? {
                Some(TableEntry::Value(value)) => writer.add(&key, &value),
                Some(TableEntry::Tombstone) if !drop_tombstones => writer.add_tombstone(&key),
                _ => {}
            }
        }
        let entries = writer.entry_count();

        if let Err(e) = writer.finish() {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        let new_table = Arc::new(SsTable::open(&path)?);

        {
            let mut levels = self.levels.write()?;
            // Remove exactly the merged inputs; a concurrent flush may have
            // registered newer L0 tables that must survive.
            let merged_paths: HashSet<PathBuf> =
                inputs.iter().map(|t| t.path().to_path_buf()).collect();
            levels[0].retain(|t| !merged_paths.contains(t.path()));
            levels[out_level].retain(|t| !merged_paths.contains(t.path()));
            levels[out_level].push(new_table);
        }

        for table in &inputs {
            if let Err(e) = fs::remove_file(table.path()) {
                tracing::warn!(path = %table.path().display(), error = %e, "Failed to delete compacted SSTable");
            }
        }

        self.stats.compactions_done.fetch_add(1, Ordering::SeqCst);
        self.refresh_gauges();
        tracing::info!(
            inputs = inputs.len(),
            entries,
            level = out_level,
            "Compacted L0 into L{out_level}"
        );
        Ok(true)
    }

    /// Freezes the active memtable once it passes the write buffer size.
    /// Caller must hold `write_mu`.
    fn maybe_freeze(&self) -> Result<()> {
        if !self.active.read()?.should_flush(self.config.memtable_size) {
            return Ok(());
        }
        self.freeze_active()?;
        Ok(())
    }

    /// Swaps in a fresh active memtable and rotates the WAL. At most one
    /// frozen memtable exists at a time; if the slot is occupied the freeze
    /// waits for the next opportunity. Caller must hold `write_mu`.
    fn freeze_active(&self) -> Result<bool> {
        let mut immutable = self.immutable.lock()?;
        if immutable.is_some() || self.active.read()?.is_empty() {
            return Ok(false);
        }

        let old = {
            let mut active = self.active.write()?;
            std::mem::replace(&mut *active, Arc::new(Memtable::new()))
        };
        *immutable = Some(old);

        {
            let mut wal = self.wal.write()?;
            wal.sync()?;
            let rotated = self
                .wal_dir()
                .join(format!("rotating_{}.wal", self.sequence.load(Ordering::SeqCst)));
            fs::rename(wal.path(), &rotated)?;
            *wal = WalWriter::open(self.wal_dir().join(CURRENT_WAL))?;
        }

        self.flush_pending.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// Blocks the write path while the active memtable is far past its
    /// write buffer and a flush is still pending. Writes stall rather than
    /// drop.
    fn stall_if_full(&self) -> Result<()> {
        let hard_cap = self.config.memtable_size * STALL_MULTIPLIER;
        let mut stalled = false;
        while self.active.read()?.approximate_size() >= hard_cap
            && self.flush_pending.load(Ordering::SeqCst)
        {
            if !stalled {
                stalled = true;
                self.stats.write_stalls.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("Write stalled: memtable over hard cap with flush pending");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn cleanup_rotated_wals(&self) {
        let Ok(rotated) = Self::rotated_wal_paths(&self.config.dir) else {
            return;
        };
        for path in rotated {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete rotated WAL");
            }
        }
    }

    fn apply_wal_record(memtable: &Memtable, record: &WalRecord) {
        match record.kind {
            WalRecordKind::Put => memtable.put(&record.key, &record.value, record.sequence),
            WalRecordKind::Delete => memtable.delete(&record.key, record.sequence),
        }
    }

    fn rotated_wal_paths(dir: &Path) -> Result<Vec<PathBuf>> {
        let wal_dir = dir.join("wal");
        if !wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&wal_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(seq) = name
                .strip_prefix("rotating_")
                .and_then(|rest| rest.strip_suffix(".wal"))
                .and_then(|seq| seq.parse::<u64>().ok())
            {
                found.push((seq, path));
            }
        }
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn parse_table_id(path: &Path) -> Option<u64> {
        path.file_name()?
            .to_str()?
            .strip_prefix("sst_")?
            .strip_suffix(".sst")?
            .parse()
            .ok()
    }

    fn wal_dir(&self) -> PathBuf {
        self.config.dir.join("wal")
    }

    fn level_dir(&self, level: usize) -> PathBuf {
        self.config.dir.join("sst").join(format!("L{level}"))
    }

    fn refresh_gauges(&self) {
        if let Ok(active) = self.active.read() {
            self.stats
                .memtable_size
                .store(active.approximate_size() as u64, Ordering::SeqCst);
            self.stats
                .memtable_entries
                .store(active.entry_count() as u64, Ordering::SeqCst);
        }
        if let Ok(wal) = self.wal.read() {
            self.stats.wal_bytes.store(wal.size(), Ordering::SeqCst);
        }
        if let Ok(levels) = self.levels.read() {
            let total: usize = levels.iter().map(|tables| tables.len()).sum();
            self.stats.sstable_count.store(total as u64, Ordering::SeqCst);
        }
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                tracing::error!(error = %e, "Failed to flush LSM engine on drop");
            }
        }
    }
}

impl StorageBackend for LsmEngine {
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get(key)
    }

    fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put(key, value)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.delete(key)
    }

    fn batch_store(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        self.put_batch(entries)
    }

    fn ping(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Background task that performs pending flushes and triggered compactions.
pub struct LsmMaintenanceTask {
    engine: Arc<LsmEngine>,
}

impl LsmMaintenanceTask {
    pub fn new(engine: Arc<LsmEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for LsmMaintenanceTask {
    fn name(&self) -> &'static str {
        "lsm-maintenance"
    }

    fn interval(&self) -> Duration {
        self.engine.config.compaction_interval
    }

    async fn execute(&self) -> Result<()> {
        if self.engine.flush_is_pending() {
            self.engine.flush()?;
        }
        if self.engine.needs_compaction() {
            self.engine.compact()?;
        }
        Ok(())
    }
}
