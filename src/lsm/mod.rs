//! Log-structured merge-tree storage engine.
//!
//! # Write path
//!
//! 1. **WAL append**: every mutation is framed into the write-ahead log
//!    before it becomes visible anywhere else.
//! 2. **Memtable insert**: the record lands in the active in-memory sorted
//!    buffer under a monotonically increasing sequence number.
//! 3. **Freeze**: past the write-buffer threshold, the active memtable moves
//!    to the immutable slot and the WAL rotates.
//! 4. **Flush**: the maintenance task writes the immutable memtable to a new
//!    L0 SSTable and retires the rotated WAL segments.
//! 5. **Compaction**: once L0 accumulates enough tables, L0 and L1 merge
//!    into a single new L1 table.
//!
//! # Read path
//!
//! Active memtable, then the immutable memtable, then SSTables newest-first:
//! L0 in reverse registration order (L0 ranges may overlap), then deeper
//! levels. Bloom filters short-circuit tables that cannot contain the key.
//! A tombstone found at any stage is an authoritative miss.

pub mod engine;
pub mod filter;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use engine::{LsmEngine, LsmMaintenanceTask, LsmStats, LsmStatsSnapshot};
pub use memtable::{InternalKey, Lookup, Memtable, ValueKind};
pub use sstable::{SsTable, SsTableWriter, TableEntry};
pub use wal::{WalReader, WalRecord, WalRecordKind, WalWriter};
