//! Write-ahead log for the LSM engine.
//!
//! Every mutation is framed and appended here before it becomes visible in
//! the memtable, so a crash can always be recovered by replay.
//!
//! # Frame format
//!
//! ```text
//! +----------+---------+------------------+
//! | crc32: 4 | len: 4  | payload: len     |
//! +----------+---------+------------------+
//! ```
//!
//! Payload:
//!
//! ```text
//! +--------+--------+----------+-----+----------+-------+
//! | type:1 | seq: 8 | klen: 4  | key | vlen: 4  | value |
//! +--------+--------+----------+-----+----------+-------+
//! ```
//!
//! All integers are little-endian. The CRC (Castagnoli) covers the payload
//! only. Delete records carry `vlen = 0` and no value bytes.
//!
//! Replay reads frames until EOF or the first malformed frame (checksum
//! mismatch, implausible length, short read). A malformed tail is the normal
//! shape of a crash-truncated log and ends replay cleanly rather than
//! erroring.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errcorrupt;
use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Frames larger than this are treated as corruption.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalRecordKind {
    Put = 0x01,
    Delete = 0x02,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    pub sequence: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl WalRecord {
    pub fn put(sequence: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            kind: WalRecordKind::Put,
            sequence,
            key,
            value,
        }
    }

    pub fn delete(sequence: u64, key: Vec<u8>) -> Self {
        Self {
            kind: WalRecordKind::Delete,
            sequence,
            key,
            value: Vec::new(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + 8 + 4 + self.key.len() + 4 + self.value.len());
        payload.push(self.kind as u8);
        payload.extend_from_slice(&self.sequence.to_le_bytes());
        payload.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        payload.extend_from_slice(&self.key);
        payload.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        payload.extend_from_slice(&self.value);
        payload
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let kind = match cursor.read_u8()? {
            0x01 => WalRecordKind::Put,
            0x02 => WalRecordKind::Delete,
            other => return errcorrupt!("unknown wal record type {other:#04x}"),
        };
        let sequence = cursor.read_u64::<LittleEndian>()?;

        let key_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;

        let value_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut value = vec![0u8; value_len];
        cursor.read_exact(&mut value)?;

        Ok(Self {
            kind,
            sequence,
            key,
            value,
        })
    }
}

/// Append-only WAL writer. Appends are serialized on an internal lock and
/// each record is written as one contiguous frame, so concurrent appenders
/// never interleave within a frame.
pub struct WalWriter {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    file: File,
}

impl WalWriter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::options().create(true).append(true).open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the WAL file in bytes.
    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let frame = Self::frame(record);
        self.writer.lock()?.write_all(&frame)?;
        Ok(())
    }

    /// Appends a batch of records, flushing to the OS once at the end.
    pub fn append_batch(&self, records: &[WalRecord]) -> Result<()> {
        let mut writer = self.writer.lock()?;
        for record in records {
            writer.write_all(&Self::frame(record))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Flushes buffered frames and syncs the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn frame(record: &WalRecord) -> Vec<u8> {
        let payload = record.encode();
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&CRC32.checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Sequential WAL reader used during recovery.
pub struct WalReader {
    reader: BufReader<File>,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// Replays every intact record in file order through `cb`, returning how
    /// many were replayed. Stops cleanly at the first malformed frame.
    pub fn replay<F: FnMut(WalRecord)>(mut self, mut cb: F) -> Result<usize> {
        let mut count = 0;
        loop {
            match self.read_frame() {
                Ok(Some(record)) => {
                    cb(record);
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, records = count, "WAL tail truncated at corrupt frame");
                    break;
                }
            }
        }
        Ok(count)
    }

    fn read_frame(&mut self) -> Result<Option<WalRecord>> {
        let stored_crc = match self.reader.read_u32::<LittleEndian>() {
            Ok(crc) => crc,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let len = self.reader.read_u32::<LittleEndian>()? as usize;
        if len == 0 || len > MAX_FRAME_SIZE {
            return errcorrupt!("implausible wal frame length {len}");
        }

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| Error::Corruption(format!("short wal frame: {e}")))?;

        let computed = CRC32.checksum(&payload);
        if computed != stored_crc {
            return errcorrupt!("wal checksum mismatch: stored {stored_crc:#010x}, computed {computed:#010x}");
        }

        WalRecord::decode(&payload).map(Some)
    }
}
