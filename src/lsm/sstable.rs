//! Immutable sorted table files.
//!
//! # File layout
//!
//! ```text
//! +-------------------+
//! | Data Record 0     |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Record n-1   |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Meta Block (bloom)|
//! +-------------------+
//! | Footer (48 bytes) |
//! +-------------------+
//! ```
//!
//! Data record: `[kind:1][klen:4][key][vlen:4][value]`. The kind octet uses
//! the same values as WAL records (Put=0x01, Delete=0x02) so tombstones
//! survive on disk until compaction retires them at the deepest level.
//!
//! Index block: `[n:4]` then `[klen:4][key][offset:8][size:8]` per record.
//! Meta block: serialized bloom filter over every key in the table.
//! Footer: index handle, meta handle, entry count, magic — all u64 LE, so a
//! reader locates everything from the last 48 bytes of the file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use super::filter::{BloomFilter, DEFAULT_FP_RATE};
use super::memtable::ValueKind;
use crate::errcorrupt;
use crate::error::{Error, Result};

pub const SSTABLE_MAGIC: u64 = 0xDC5F00DA;
pub const FOOTER_SIZE: u64 = 48;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug)]
struct Footer {
    index: BlockHandle,
    meta: BlockHandle,
    num_entries: u64,
    magic: u64,
}

impl Footer {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE as usize);
        buf.extend_from_slice(&self.index.offset.to_le_bytes());
        buf.extend_from_slice(&self.index.size.to_le_bytes());
        buf.extend_from_slice(&self.meta.offset.to_le_bytes());
        buf.extend_from_slice(&self.meta.size.to_le_bytes());
        buf.extend_from_slice(&self.num_entries.to_le_bytes());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        Ok(Self {
            index: BlockHandle {
                offset: cursor.read_u64::<LittleEndian>()?,
                size: cursor.read_u64::<LittleEndian>()?,
            },
            meta: BlockHandle {
                offset: cursor.read_u64::<LittleEndian>()?,
                size: cursor.read_u64::<LittleEndian>()?,
            },
            num_entries: cursor.read_u64::<LittleEndian>()?,
            magic: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// A record as read back from a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableEntry {
    Value(Vec<u8>),
    Tombstone,
}

/// Accumulates records in memory, then writes the sorted file in one pass.
pub struct SsTableWriter {
    path: PathBuf,
    entries: Vec<(Vec<u8>, ValueKind, Vec<u8>)>,
}

impl SsTableWriter {
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.entries.push((key.to_vec(), ValueKind::Value, value.to_vec()));
    }

    pub fn add_tombstone(&mut self, key: &[u8]) {
        self.entries.push((key.to_vec(), ValueKind::Deletion, Vec::new()));
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Sorts, writes data records, index, bloom meta block and footer, then
    /// syncs the file.
    pub fn finish(mut self) -> Result<()> {
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));

        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        let mut offset = 0u64;

        let mut bloom = BloomFilter::new(self.entries.len(), DEFAULT_FP_RATE);
        let mut index_entries: Vec<(Vec<u8>, BlockHandle)> = Vec::with_capacity(self.entries.len());

        for (key, kind, value) in &self.entries {
            let mut record = Vec::with_capacity(1 + 4 + key.len() + 4 + value.len());
            record.push(*kind as u8);
            record.extend_from_slice(&(key.len() as u32).to_le_bytes());
            record.extend_from_slice(key);
            record.extend_from_slice(&(value.len() as u32).to_le_bytes());
            record.extend_from_slice(value);

            writer.write_all(&record)?;
            bloom.add(key);
            index_entries.push((
                key.clone(),
                BlockHandle {
                    offset,
                    size: record.len() as u64,
                },
            ));
            offset += record.len() as u64;
        }

        let index = BlockHandle {
            offset,
            size: {
                let mut block = Vec::new();
                block.extend_from_slice(&(index_entries.len() as u32).to_le_bytes());
                for (key, handle) in &index_entries {
                    block.extend_from_slice(&(key.len() as u32).to_le_bytes());
                    block.extend_from_slice(key);
                    block.extend_from_slice(&handle.offset.to_le_bytes());
                    block.extend_from_slice(&handle.size.to_le_bytes());
                }
                writer.write_all(&block)?;
                block.len() as u64
            },
        };
        offset += index.size;

        let meta_block = bloom.encode();
        let meta = BlockHandle {
            offset,
            size: meta_block.len() as u64,
        };
        writer.write_all(&meta_block)?;

        let footer = Footer {
            index,
            meta,
            num_entries: self.entries.len() as u64,
            magic: SSTABLE_MAGIC,
        };
        writer.write_all(&footer.encode())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Read handle over a finished table. Immutable after open; safe to share.
#[derive(Debug)]
pub struct SsTable {
    path: PathBuf,
    file: File,
    bloom: BloomFilter,
    index: HashMap<Vec<u8>, BlockHandle>,
    num_entries: u64,
}

impl SsTable {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE {
            return errcorrupt!("sstable {} too short ({} bytes)", path.display(), file_size);
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer_buf = vec![0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;
        if footer.magic != SSTABLE_MAGIC {
            return errcorrupt!(
                "sstable {} bad magic {:#010x}",
                path.display(),
                footer.magic
            );
        }

        let mut meta_buf = vec![0u8; footer.meta.size as usize];
        file.seek(SeekFrom::Start(footer.meta.offset))?;
        file.read_exact(&mut meta_buf)?;
        let bloom = BloomFilter::decode(&meta_buf)?;

        let mut index_buf = vec![0u8; footer.index.size as usize];
        file.seek(SeekFrom::Start(footer.index.offset))?;
        file.read_exact(&mut index_buf)?;
        let index = Self::decode_index(&index_buf)?;

        if index.len() as u64 != footer.num_entries {
            return errcorrupt!(
                "sstable {} index has {} keys, footer claims {}",
                path.display(),
                index.len(),
                footer.num_entries
            );
        }

        Ok(Self {
            path,
            file,
            bloom,
            index,
            num_entries: footer.num_entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.num_entries
    }

    /// Point lookup: bloom filter, then index, then one record read. The
    /// stored key is checked against the requested key to catch corruption.
    pub fn get(&self, key: &[u8]) -> Result<Option<TableEntry>> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        let Some(&handle) = self.index.get(key) else {
            return Ok(None);
        };

        let (stored_key, entry) = self.read_record(handle)?;
        if stored_key != key {
            return errcorrupt!(
                "sstable {} record key mismatch at offset {}",
                self.path.display(),
                handle.offset
            );
        }
        Ok(Some(entry))
    }

    /// All keys in ascending order, for compaction.
    pub fn keys_sorted(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.index.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn read_record(&self, handle: BlockHandle) -> Result<(Vec<u8>, TableEntry)> {
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(handle.offset))?;

        let mut record = vec![0u8; handle.size as usize];
        reader.read_exact(&mut record)?;

        let mut cursor = Cursor::new(record.as_slice());
        let kind = ValueKind::from_u8(cursor.read_u8()?)
            .ok_or_else(|| Error::Corruption(format!("bad record kind in {}", self.path.display())))?;

        let key_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;

        let value_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value)?;

        let entry = match kind {
            ValueKind::Value => TableEntry::Value(value),
            ValueKind::Deletion => TableEntry::Tombstone,
        };
        Ok((key, entry))
    }

    fn decode_index(data: &[u8]) -> Result<HashMap<Vec<u8>, BlockHandle>> {
        let mut cursor = Cursor::new(data);
        let n = cursor.read_u32::<LittleEndian>()?;
        let mut index = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            let key_len = cursor.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;
            let handle = BlockHandle {
                offset: cursor.read_u64::<LittleEndian>()?,
                size: cursor.read_u64::<LittleEndian>()?,
            };
            index.insert(key, handle);
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;

    fn build_table(path: &Path, entries: &[(&[u8], &[u8])]) -> Result<SsTable> {
        let mut writer = SsTableWriter::create(path);
        for (key, value) in entries {
            writer.add(key, value);
        }
        writer.finish()?;
        SsTable::open(path)
    }

    #[test]
    fn test_write_read_roundtrip() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        // Added out of order; the writer sorts.
        let table = build_table(file.path(), &[
            (b"banana", b"fruit"),
            (b"apple", b"fruit"),
            (b"bandana", b"clothing"),
            (b"band", b"music"),
        ])?;

        assert_eq!(table.entry_count(), 4);
        assert_eq!(table.get(b"apple")?, Some(TableEntry::Value(b"fruit".to_vec())));
        assert_eq!(table.get(b"band")?, Some(TableEntry::Value(b"music".to_vec())));
        assert_eq!(table.get(b"bandana")?, Some(TableEntry::Value(b"clothing".to_vec())));
        assert_eq!(table.get(b"missing")?, None);
        Ok(())
    }

    #[test]
    fn test_tombstones_survive_roundtrip() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let mut writer = SsTableWriter::create(file.path());
        writer.add(b"live", b"v");
        writer.add_tombstone(b"dead");
        writer.finish()?;

        let table = SsTable::open(file.path())?;
        assert_eq!(table.get(b"live")?, Some(TableEntry::Value(b"v".to_vec())));
        assert_eq!(table.get(b"dead")?, Some(TableEntry::Tombstone));
        Ok(())
    }

    #[test]
    fn test_keys_sorted() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let table = build_table(file.path(), &[(b"c", b"3"), (b"a", b"1"), (b"b", b"2")])?;
        assert_eq!(table.keys_sorted(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_empty_table() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let writer = SsTableWriter::create(file.path());
        writer.finish()?;

        let table = SsTable::open(file.path())?;
        assert_eq!(table.entry_count(), 0);
        assert_eq!(table.get(b"anything")?, None);
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), vec![0u8; 128]).unwrap();

        match SsTable::open(file.path()) {
            Err(Error::Corruption(_)) => Ok(()),
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn test_short_file_rejected() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), b"tiny").unwrap();

        match SsTable::open(file.path()) {
            Err(Error::Corruption(_)) => Ok(()),
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn test_large_table_lookup() -> Result<()> {
        let file = NamedTempFile::new().expect("temp file");
        let mut writer = SsTableWriter::create(file.path());
        for i in 0..1000u32 {
            writer.add(format!("key_{i:04}").as_bytes(), format!("value_{i}").as_bytes());
        }
        writer.finish()?;

        let table = SsTable::open(file.path())?;
        assert_eq!(table.entry_count(), 1000);
        for i in (0..1000u32).step_by(97) {
            assert_eq!(
                table.get(format!("key_{i:04}").as_bytes())?,
                Some(TableEntry::Value(format!("value_{i}").into_bytes()))
            );
        }
        assert_eq!(table.get(b"key_9999")?, None);
        Ok(())
    }
}
