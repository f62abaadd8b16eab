use std::path::PathBuf;
use std::time::Duration;

use crate::manager::WriteMode;

/// Server-wide configuration. Built by the embedding application; the server
/// itself does no option parsing.
#[derive(Debug, Clone)]
pub struct Config {
    /// RESP TCP port (default: 6379)
    pub listen_port: u16,

    /// Total cache capacity in entries, across all segments (default: 65536)
    pub cache_capacity: usize,

    /// Write strategy for PUTs (default: write-back)
    pub write_mode: WriteMode,

    /// Write-back flush period (default: 5s)
    pub flush_interval: Duration,

    /// Root directory for WAL, SSTables and Raft state (default: ./data)
    pub data_dir: PathBuf,

    /// Number of cache segments, must be > 0 (default: 32)
    pub segments: usize,

    /// Memtable freeze threshold in bytes (default: 4 MiB)
    pub memtable_size: usize,

    /// Number of L0 tables that triggers an L0->L1 compaction (default: 4)
    pub l0_compact_trigger: usize,

    /// Number of SSTable levels (default: 4)
    pub max_levels: usize,

    /// How often the LSM maintenance task checks for pending flushes and
    /// compactions (default: 100ms)
    pub compaction_interval: Duration,

    /// How often metrics snapshots are emitted to the observer (default: 5s)
    pub metrics_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6379,
            cache_capacity: 65536,
            write_mode: WriteMode::WriteBack,
            flush_interval: Duration::from_secs(5),
            data_dir: PathBuf::from("./data"),
            segments: 32,
            memtable_size: 4 * 1024 * 1024,
            l0_compact_trigger: 4,
            max_levels: 4,
            compaction_interval: Duration::from_millis(100),
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn segments(mut self, segments: usize) -> Self {
        assert!(segments > 0, "segments must be > 0");
        self.segments = segments;
        self
    }

    pub fn memtable_size(mut self, bytes: usize) -> Self {
        self.memtable_size = bytes;
        self
    }

    pub fn l0_compact_trigger(mut self, tables: usize) -> Self {
        self.l0_compact_trigger = tables;
        self
    }

    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Derive the storage-engine slice of this configuration.
    pub fn lsm(&self) -> LsmConfig {
        LsmConfig {
            dir: self.data_dir.clone(),
            memtable_size: self.memtable_size,
            l0_compact_trigger: self.l0_compact_trigger,
            max_levels: self.max_levels,
            compaction_interval: self.compaction_interval,
        }
    }
}

/// Configuration for the LSM storage engine alone.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory for `wal/` and `sst/` subtrees
    pub dir: PathBuf,

    /// Memtable freeze threshold in bytes (default: 4 MiB)
    pub memtable_size: usize,

    /// L0 table count that triggers compaction (default: 4)
    pub l0_compact_trigger: usize,

    /// Number of levels (default: 4)
    pub max_levels: usize,

    /// Maintenance task period (default: 100ms)
    pub compaction_interval: Duration,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            memtable_size: 4 * 1024 * 1024,
            l0_compact_trigger: 4,
            max_levels: 4,
            compaction_interval: Duration::from_millis(100),
        }
    }
}

impl LsmConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn memtable_size(mut self, bytes: usize) -> Self {
        self.memtable_size = bytes;
        self
    }

    pub fn l0_compact_trigger(mut self, tables: usize) -> Self {
        self.l0_compact_trigger = tables;
        self
    }

    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_port, 6379);
        assert_eq!(config.cache_capacity, 65536);
        assert_eq!(config.write_mode, WriteMode::WriteBack);
        assert_eq!(config.segments, 32);
        assert_eq!(config.memtable_size, 4 * 1024 * 1024);
        assert_eq!(config.l0_compact_trigger, 4);
        assert_eq!(config.max_levels, 4);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .listen_port(7000)
            .cache_capacity(1024)
            .write_mode(WriteMode::WriteThrough)
            .segments(8)
            .memtable_size(1024 * 1024);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.cache_capacity, 1024);
        assert_eq!(config.write_mode, WriteMode::WriteThrough);
        assert_eq!(config.segments, 8);

        let lsm = config.lsm();
        assert_eq!(lsm.dir, PathBuf::from("/tmp/test"));
        assert_eq!(lsm.memtable_size, 1024 * 1024);
    }

    #[test]
    #[should_panic(expected = "segments must be > 0")]
    fn test_zero_segments_rejected() {
        let _ = Config::default().segments(0);
    }
}
