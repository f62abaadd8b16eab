//! Persistent Raft state: current term, vote, and the entry log.
//!
//! On disk:
//! - `raft_state.dat`: `[current_term:8 LE][voted_for:4 LE]` where -1 means
//!   no vote this term. Rewritten atomically on every term/vote change.
//! - `raft_log.dat`: append-only records `[term:8][index:8][cmdlen:4][cmd]`,
//!   all little-endian. Conflict truncation rewrites the whole file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

const STATE_FILE: &str = "raft_state.dat";
const LOG_FILE: &str = "raft_log.dat";

/// Commands larger than this are treated as corruption when loading.
const MAX_COMMAND_SIZE: usize = 64 * 1024 * 1024;

/// Replication ships at most this many entries per AppendEntries.
const MAX_ENTRIES_PER_RPC: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default)]
struct PersistentState {
    current_term: u64,
    voted_for: Option<u32>,
}

pub struct RaftLog {
    dir: PathBuf,
    state: Mutex<PersistentState>,
    entries: Mutex<Vec<LogEntry>>,
}

impl RaftLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let state = Self::load_state(&dir)?;
        let entries = Self::load_entries(&dir)?;

        Ok(Self {
            dir,
            state: Mutex::new(state),
            entries: Mutex::new(entries),
        })
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().unwrap().current_term
    }

    pub fn voted_for(&self) -> Option<u32> {
        self.state.lock().unwrap().voted_for
    }

    /// Moves to a new term with no vote cast.
    pub fn set_term(&self, term: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.current_term = term;
        state.voted_for = None;
        self.persist_state(&state)
    }

    pub fn set_voted_for(&self, candidate: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.voted_for = Some(candidate);
        self.persist_state(&state)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_index(&self) -> u64 {
        self.entries.lock().unwrap().last().map_or(0, |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.lock().unwrap().last().map_or(0, |e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.index == index)
            .cloned()
    }

    pub fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.index == index)
            .map_or(0, |e| e.term)
    }

    /// Entries from `start_index` on, capped for one RPC.
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.index >= start_index)
            .take(MAX_ENTRIES_PER_RPC)
            .cloned()
            .collect()
    }

    /// Log-consistency check for AppendEntries. Index 0 always matches.
    pub fn matches_at(&self, index: u64, term: u64) -> bool {
        if index == 0 {
            return true;
        }
        let t = self.term_at(index);
        t == 0 || t == term
    }

    pub fn append(&self, entry: LogEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        self.append_to_file(&entry)?;
        entries.push(entry);
        Ok(())
    }

    /// Drops every entry with `index >= from`, rewriting the log file.
    pub fn truncate_from(&self, from: u64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.index < from);
        self.rewrite_file(&entries)
    }

    fn load_state(dir: &PathBuf) -> Result<PersistentState> {
        let path = dir.join(STATE_FILE);
        let Ok(mut file) = File::open(&path) else {
            return Ok(PersistentState::default());
        };
        let current_term = file.read_u64::<LittleEndian>()?;
        let voted = file.read_i32::<LittleEndian>()?;
        Ok(PersistentState {
            current_term,
            voted_for: (voted >= 0).then_some(voted as u32),
        })
    }

    fn persist_state(&self, state: &PersistentState) -> Result<()> {
        let mut file = File::create(self.dir.join(STATE_FILE))?;
        file.write_u64::<LittleEndian>(state.current_term)?;
        file.write_i32::<LittleEndian>(state.voted_for.map_or(-1, |id| id as i32))?;
        file.sync_all()?;
        Ok(())
    }

    fn load_entries(dir: &PathBuf) -> Result<Vec<LogEntry>> {
        let path = dir.join(LOG_FILE);
        let Ok(file) = File::open(&path) else {
            return Ok(Vec::new());
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            let term = match reader.read_u64::<LittleEndian>() {
                Ok(term) => term,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let index = reader.read_u64::<LittleEndian>()?;
            let len = reader.read_u32::<LittleEndian>()? as usize;
            if len > MAX_COMMAND_SIZE {
                tracing::warn!(entries = entries.len(), "Raft log tail truncated at implausible length");
                break;
            }
            let mut command = vec![0u8; len];
            if reader.read_exact(&mut command).is_err() {
                tracing::warn!(entries = entries.len(), "Raft log tail truncated at short read");
                break;
            }
            entries.push(LogEntry {
                term,
                index,
                command,
            });
        }
        Ok(entries)
    }

    fn append_to_file(&self, entry: &LogEntry) -> Result<()> {
        let file = File::options()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        let mut writer = BufWriter::new(file);
        writer.write_u64::<LittleEndian>(entry.term)?;
        writer.write_u64::<LittleEndian>(entry.index)?;
        writer.write_u32::<LittleEndian>(entry.command.len() as u32)?;
        writer.write_all(&entry.command)?;
        writer.flush()?;
        Ok(())
    }

    fn rewrite_file(&self, entries: &[LogEntry]) -> Result<()> {
        let file = File::create(self.dir.join(LOG_FILE))?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            writer.write_u64::<LittleEndian>(entry.term)?;
            writer.write_u64::<LittleEndian>(entry.index)?;
            writer.write_u32::<LittleEndian>(entry.command.len() as u32)?;
            writer.write_all(&entry.command)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn entry(term: u64, index: u64, cmd: &[u8]) -> LogEntry {
        LogEntry {
            term,
            index,
            command: cmd.to_vec(),
        }
    }

    #[test]
    fn test_fresh_log_defaults() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let log = RaftLog::open(dir.path())?;

        assert_eq!(log.current_term(), 0);
        assert_eq!(log.voted_for(), None);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert!(log.is_empty());
        Ok(())
    }

    #[test]
    fn test_term_and_vote_persist() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        {
            let log = RaftLog::open(dir.path())?;
            log.set_term(7)?;
            log.set_voted_for(2)?;
        }

        let log = RaftLog::open(dir.path())?;
        assert_eq!(log.current_term(), 7);
        assert_eq!(log.voted_for(), Some(2));

        // A new term clears the vote.
        log.set_term(8)?;
        assert_eq!(log.voted_for(), None);
        Ok(())
    }

    #[test]
    fn test_entries_persist_and_reload() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        {
            let log = RaftLog::open(dir.path())?;
            log.append(entry(1, 1, b"PUT a 1"))?;
            log.append(entry(1, 2, b"PUT b 2"))?;
            log.append(entry(2, 3, b"DEL a"))?;
        }

        let log = RaftLog::open(dir.path())?;
        assert_eq!(log.len(), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entry(2), Some(entry(1, 2, b"PUT b 2")));
        assert_eq!(log.term_at(3), 2);
        assert_eq!(log.term_at(99), 0);
        Ok(())
    }

    #[test]
    fn test_truncate_from_rewrites() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        {
            let log = RaftLog::open(dir.path())?;
            for i in 1..=5 {
                log.append(entry(1, i, b"cmd"))?;
            }
            log.truncate_from(3)?;
            assert_eq!(log.last_index(), 2);
        }

        // Truncation survives a restart.
        let log = RaftLog::open(dir.path())?;
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_index(), 2);
        Ok(())
    }

    #[test]
    fn test_entries_from() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let log = RaftLog::open(dir.path())?;
        for i in 1..=10 {
            log.append(entry(1, i, b"cmd"))?;
        }

        let tail = log.entries_from(7);
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0].index, 7);
        assert_eq!(tail[3].index, 10);
        Ok(())
    }

    #[test]
    fn test_matches_at() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let log = RaftLog::open(dir.path())?;
        log.append(entry(3, 1, b"cmd"))?;

        assert!(log.matches_at(0, 0));
        assert!(log.matches_at(1, 3));
        assert!(!log.matches_at(1, 2));
        // Unknown index is treated as a match (compacted entry).
        assert!(log.matches_at(5, 1));
        Ok(())
    }
}
