//! Command dispatcher: maps parsed RESP tokens onto the cache manager.
//!
//! When a Raft node is attached, SET and DEL go through a proposal and are
//! applied to the manager by the applier callback; reads are always served
//! locally.

use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::Error;
use crate::lsm::LsmEngine;
use crate::manager::CacheManager;
use crate::raft::node::RaftNode;
use crate::resp;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One reply per request; `close` ends the connection after it is sent.
pub struct Reply {
    pub data: Vec<u8>,
    pub close: bool,
}

impl Reply {
    fn send(data: Vec<u8>) -> Self {
        Self { data, close: false }
    }

    fn send_and_close(data: Vec<u8>) -> Self {
        Self { data, close: true }
    }
}

pub struct CommandHandler {
    manager: Arc<CacheManager>,
    engine: Option<Arc<LsmEngine>>,
    raft: Option<Arc<RaftNode>>,
}

impl CommandHandler {
    pub fn new(
        manager: Arc<CacheManager>,
        engine: Option<Arc<LsmEngine>>,
        raft: Option<Arc<RaftNode>>,
    ) -> Self {
        Self {
            manager,
            engine,
            raft,
        }
    }

    pub fn execute(&self, tokens: &[Vec<u8>]) -> Reply {
        let Some(first) = tokens.first() else {
            return Reply::send(resp::error("empty command"));
        };
        let command = String::from_utf8_lossy(first).to_ascii_uppercase();

        match command.as_str() {
            "GET" => self.cmd_get(tokens),
            "SET" => self.cmd_set(tokens),
            "DEL" => self.cmd_del(tokens),
            "EXISTS" => self.cmd_exists(tokens),
            "KEYS" => Reply::send(resp::array(&self.manager.keys())),
            "DBSIZE" => Reply::send(resp::integer(self.manager.size() as i64)),
            "FLUSHALL" | "FLUSHDB" => {
                self.manager.flush_all();
                Reply::send(resp::simple_string("OK"))
            }
            "PING" => match tokens.get(1) {
                Some(message) => Reply::send(resp::bulk(message)),
                None => Reply::send(resp::simple_string("PONG")),
            },
            "INFO" => Reply::send(resp::bulk(self.info_body().as_bytes())),
            "QUIT" => Reply::send_and_close(resp::simple_string("OK")),
            // redis-cli handshake stubs
            "COMMAND" | "CLIENT" => Reply::send(resp::simple_string("OK")),
            "CONFIG" => self.cmd_config(tokens),
            _ => Reply::send(resp::error(&format!(
                "unknown command '{}'",
                String::from_utf8_lossy(first)
            ))),
        }
    }

    fn cmd_get(&self, tokens: &[Vec<u8>]) -> Reply {
        if tokens.len() != 2 {
            return Reply::send(resp::error("wrong number of arguments for 'GET'"));
        }
        match self.manager.get(&tokens[1]) {
            Ok(Some(value)) => Reply::send(resp::bulk(&value)),
            Ok(None) => Reply::send(resp::null_bulk()),
            Err(e) => Reply::send(resp::error(&e.to_string())),
        }
    }

    fn cmd_set(&self, tokens: &[Vec<u8>]) -> Reply {
        if tokens.len() < 3 {
            return Reply::send(resp::error("wrong number of arguments for 'SET'"));
        }
        let key = &tokens[1];
        // Inline clients split values on whitespace; rejoin with single
        // spaces. Array-framed clients send one bulk and this is a no-op.
        let value = tokens[2..].join(&b' ');

        if let Some(raft) = &self.raft {
            return match raft.propose(encode_put(key, &value)) {
                Ok(_) => Reply::send(resp::simple_string("OK")),
                Err(Error::NotLeader) => {
                    Reply::send(resp::error("not the leader, retry on the leader"))
                }
                Err(e) => Reply::send(resp::error(&e.to_string())),
            };
        }

        match self.manager.put(key, &value) {
            Ok(()) => Reply::send(resp::simple_string("OK")),
            Err(e) => Reply::send(resp::error(&e.to_string())),
        }
    }

    fn cmd_del(&self, tokens: &[Vec<u8>]) -> Reply {
        if tokens.len() < 2 {
            return Reply::send(resp::error("wrong number of arguments for 'DEL'"));
        }

        if let Some(raft) = &self.raft {
            // Cache-local count at propose time; the deletes apply when the
            // entries commit.
            let mut count = 0i64;
            for key in &tokens[1..] {
                if self.manager.exists(key) {
                    count += 1;
                }
                match raft.propose(encode_del(key)) {
                    Ok(_) => {}
                    Err(Error::NotLeader) => {
                        return Reply::send(resp::error("not the leader, retry on the leader"))
                    }
                    Err(e) => return Reply::send(resp::error(&e.to_string())),
                }
            }
            return Reply::send(resp::integer(count));
        }

        let mut count = 0i64;
        for key in &tokens[1..] {
            match self.manager.del(key) {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => return Reply::send(resp::error(&e.to_string())),
            }
        }
        Reply::send(resp::integer(count))
    }

    fn cmd_exists(&self, tokens: &[Vec<u8>]) -> Reply {
        if tokens.len() != 2 {
            return Reply::send(resp::error("wrong number of arguments for 'EXISTS'"));
        }
        Reply::send(resp::integer(self.manager.exists(&tokens[1]) as i64))
    }

    fn cmd_config(&self, tokens: &[Vec<u8>]) -> Reply {
        // redis-cli probes CONFIG GET save / appendonly on connect; answer
        // with an empty value for the requested parameter.
        if tokens.len() >= 3 && tokens[1].eq_ignore_ascii_case(b"GET") {
            return Reply::send(resp::array(&[tokens[2].clone(), Vec::new()]));
        }
        Reply::send(resp::simple_string("OK"))
    }

    fn info_body(&self) -> String {
        let stats = self.manager.stats().snapshot();
        let mut info = String::new();
        info.push_str("# Server\r\n");
        info.push_str(&format!("distributed_cache_version:{SERVER_VERSION}\r\n"));
        info.push_str(&format!("write_mode:{}\r\n", self.manager.write_mode().as_str()));
        info.push_str("\r\n# Stats\r\n");
        info.push_str(&format!("cache_hits:{}\r\n", stats.cache_hits));
        info.push_str(&format!("cache_misses:{}\r\n", stats.cache_misses));
        info.push_str(&format!("write_through_ops:{}\r\n", stats.write_through_ops));
        info.push_str(&format!("write_back_ops:{}\r\n", stats.write_back_ops));
        info.push_str("\r\n# Keyspace\r\n");
        info.push_str(&format!("keys:{}\r\n", self.manager.size()));

        if let Some(engine) = &self.engine {
            let lsm = engine.stats().snapshot();
            info.push_str("\r\n# Storage\r\n");
            info.push_str(&format!("memtable_size:{}\r\n", lsm.memtable_size));
            info.push_str(&format!("memtable_entries:{}\r\n", lsm.memtable_entries));
            info.push_str(&format!("sstable_count:{}\r\n", lsm.sstable_count));
            info.push_str(&format!("compactions_done:{}\r\n", lsm.compactions_done));
            info.push_str(&format!("total_puts:{}\r\n", lsm.total_puts));
            info.push_str(&format!("total_gets:{}\r\n", lsm.total_gets));
            info.push_str(&format!("total_deletes:{}\r\n", lsm.total_deletes));
            info.push_str(&format!("write_stalls:{}\r\n", lsm.write_stalls));
        }
        info
    }
}

// ── Raft command encoding ──
//
// Length-prefixed binary so keys and values replicate byte-exact:
// `[op:1][klen:4 LE][key][vlen:4 LE][value]`, ops Put=0x01 / Delete=0x02.

const OP_PUT: u8 = 0x01;
const OP_DEL: u8 = 0x02;

pub fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(1 + 4 + key.len() + 4 + value.len());
    cmd.push(OP_PUT);
    cmd.extend_from_slice(&(key.len() as u32).to_le_bytes());
    cmd.extend_from_slice(key);
    cmd.extend_from_slice(&(value.len() as u32).to_le_bytes());
    cmd.extend_from_slice(value);
    cmd
}

pub fn encode_del(key: &[u8]) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(1 + 4 + key.len());
    cmd.push(OP_DEL);
    cmd.extend_from_slice(&(key.len() as u32).to_le_bytes());
    cmd.extend_from_slice(key);
    cmd
}

/// Applies a committed Raft command to the cache manager. Used as the
/// node's apply callback.
pub fn apply_command(manager: &CacheManager, command: &[u8]) {
    let mut cursor = std::io::Cursor::new(command);
    let outcome = (|| -> crate::error::Result<()> {
        let op = cursor.read_u8()?;
        let key_len = cursor.read_u32::<LittleEndian>()? as usize;
        let pos = cursor.position() as usize;
        let key = command
            .get(pos..pos + key_len)
            .ok_or_else(|| Error::Corruption("short raft command".into()))?;
        cursor.set_position((pos + key_len) as u64);

        match op {
            OP_PUT => {
                let value_len = cursor.read_u32::<LittleEndian>()? as usize;
                let pos = cursor.position() as usize;
                let value = command
                    .get(pos..pos + value_len)
                    .ok_or_else(|| Error::Corruption("short raft command".into()))?;
                manager.put(key, value)?;
            }
            OP_DEL => {
                manager.del(key)?;
            }
            other => return Err(Error::Corruption(format!("unknown raft op {other:#04x}"))),
        }
        Ok(())
    })();

    if let Err(e) = outcome {
        tracing::error!(error = %e, "Failed to apply raft command");
    }
}
