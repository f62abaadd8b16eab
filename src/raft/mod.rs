//! Minimal Raft consensus for ordering write commands.
//!
//! The node (`node.rs`) runs leader election and log replication over an
//! abstract [`RaftTransport`]; the persistent term/vote and the append-only
//! entry log live in `log.rs`. Committed commands are handed to an apply
//! callback in index order — the command dispatcher uses that callback to
//! mutate the cache manager.

pub mod log;
pub mod node;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use log::LogEntry;
use node::RaftNode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl RaftRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u32,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: u32,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

/// RPC surface between nodes. Calls are synchronous; an `Err` is treated as
/// an unreachable peer.
pub trait RaftTransport: Send + Sync {
    fn request_vote(&self, peer: u32, args: &RequestVoteArgs) -> Result<RequestVoteReply>;
    fn append_entries(&self, peer: u32, args: &AppendEntriesArgs) -> Result<AppendEntriesReply>;
}

/// In-process transport: peers are a registry of nodes, RPCs are direct
/// calls. Used for single-process clusters and tests.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<u32, Arc<RaftNode>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: u32, node: Arc<RaftNode>) {
        self.nodes.write().unwrap().insert(id, node);
    }
}

impl RaftTransport for LocalTransport {
    fn request_vote(&self, peer: u32, args: &RequestVoteArgs) -> Result<RequestVoteReply> {
        let node = self
            .nodes
            .read()
            .unwrap()
            .get(&peer)
            .cloned()
            .ok_or_else(|| Error::IO(format!("unknown peer {peer}")))?;
        Ok(node.handle_request_vote(args))
    }

    fn append_entries(&self, peer: u32, args: &AppendEntriesArgs) -> Result<AppendEntriesReply> {
        let node = self
            .nodes
            .read()
            .unwrap()
            .get(&peer)
            .cloned()
            .ok_or_else(|| Error::IO(format!("unknown peer {peer}")))?;
        Ok(node.handle_append_entries(args))
    }
}
