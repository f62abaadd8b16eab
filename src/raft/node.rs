//! Raft node: roles, election, replication, commit and apply.
//!
//! The node is driven from outside by two periodic tasks: [`RaftTickerTask`]
//! (leader heartbeats / follower election timeouts, every ~50ms) and
//! [`RaftApplierTask`] (applies committed entries through the apply
//! callback). RPCs are issued without holding the node lock; replies are
//! tallied under it.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;

use super::log::{LogEntry, RaftLog};
use super::{
    AppendEntriesArgs, AppendEntriesReply, RaftRole, RaftTransport, RequestVoteArgs,
    RequestVoteReply,
};
use crate::error::{Error, Result};
use crate::tasks::BackgroundTask;

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const APPLY_INTERVAL: Duration = Duration::from_millis(10);
const ELECTION_TIMEOUT_MS: std::ops::RangeInclusive<u64> = 150..=300;

/// Called with `(index, command)` for each committed entry, in index order.
pub type ApplyFn = Box<dyn Fn(u64, &[u8]) + Send + Sync>;

struct Volatile {
    role: RaftRole,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<u32>,
    votes_received: u32,
    next_index: Vec<u64>,
    match_index: Vec<u64>,
    last_heartbeat: Instant,
    election_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub id: u32,
    pub role: RaftRole,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_len: usize,
    pub leader_id: Option<u32>,
}

pub struct RaftNode {
    id: u32,
    cluster_size: u32,
    log: RaftLog,
    transport: Arc<dyn RaftTransport>,
    state: Mutex<Volatile>,
    apply: RwLock<Option<ApplyFn>>,
}

impl RaftNode {
    pub fn new(
        id: u32,
        cluster_size: u32,
        dir: impl Into<std::path::PathBuf>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>> {
        let log = RaftLog::open(dir)?;
        Ok(Arc::new(Self {
            id,
            cluster_size,
            log,
            transport,
            state: Mutex::new(Volatile {
                role: RaftRole::Follower,
                commit_index: 0,
                last_applied: 0,
                leader_id: None,
                votes_received: 0,
                next_index: vec![1; cluster_size as usize],
                match_index: vec![0; cluster_size as usize],
                last_heartbeat: Instant::now(),
                election_timeout: Self::random_timeout(),
            }),
            apply: RwLock::new(None),
        }))
    }

    /// Installs the state-machine apply callback. Must be set before the
    /// applier task starts delivering committed entries.
    pub fn set_apply(&self, cb: ApplyFn) {
        *self.apply.write().unwrap() = Some(cb);
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().unwrap().role == RaftRole::Leader
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.lock().unwrap();
        NodeStatus {
            id: self.id,
            role: state.role,
            term: self.log.current_term(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_len: self.log.len(),
            leader_id: state.leader_id,
        }
    }

    /// Appends a command to the leader's log. Replication happens on the
    /// next heartbeat; commit and apply follow asynchronously.
    pub fn propose(&self, command: Vec<u8>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.role != RaftRole::Leader {
            return Err(Error::NotLeader);
        }

        let entry = LogEntry {
            term: self.log.current_term(),
            index: self.log.last_index() + 1,
            command,
        };
        let index = entry.index;
        self.log.append(entry)?;
        // A single-node cluster commits on its own majority.
        self.try_advance_commit(&mut state);
        Ok(index)
    }

    /// One scheduler tick: leaders heartbeat, followers check their
    /// election timer.
    pub fn tick(&self) {
        enum Action {
            Heartbeat,
            Election,
            Wait,
        }
        let action = {
            let state = self.state.lock().unwrap();
            match state.role {
                RaftRole::Leader => Action::Heartbeat,
                _ if state.last_heartbeat.elapsed() >= state.election_timeout => Action::Election,
                _ => Action::Wait,
            }
        };
        // RPCs go out without the node lock held.
        let outcome = match action {
            Action::Heartbeat => self.send_heartbeats(),
            Action::Election => self.start_election(),
            Action::Wait => Ok(()),
        };
        if let Err(e) = outcome {
            tracing::error!(node = self.id, error = %e, "Raft tick failed");
        }
    }

    /// Delivers newly committed entries to the apply callback, in order.
    pub fn apply_committed(&self) {
        let to_apply: Vec<LogEntry> = {
            let mut state = self.state.lock().unwrap();
            let mut out = Vec::new();
            while state.last_applied < state.commit_index {
                state.last_applied += 1;
                if let Some(entry) = self.log.entry(state.last_applied) {
                    out.push(entry);
                }
            }
            out
        };
        if to_apply.is_empty() {
            return;
        }

        let apply = self.apply.read().unwrap();
        if let Some(cb) = apply.as_ref() {
            for entry in to_apply {
                cb(entry.index, &entry.command);
            }
        }
    }

    /// Starts an election immediately, ignoring the timer.
    pub fn trigger_election(&self) -> Result<()> {
        self.start_election()
    }

    // ── RPC handlers ──

    pub fn handle_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().unwrap();

        if args.term < self.log.current_term() {
            return RequestVoteReply {
                term: self.log.current_term(),
                vote_granted: false,
            };
        }
        if args.term > self.log.current_term() {
            self.become_follower(&mut state, args.term);
        }

        let log_ok = args.last_log_term > self.log.last_term()
            || (args.last_log_term == self.log.last_term()
                && args.last_log_index >= self.log.last_index());
        let can_vote = match self.log.voted_for() {
            None => true,
            Some(candidate) => candidate == args.candidate_id,
        };

        let vote_granted = can_vote && log_ok;
        if vote_granted {
            if let Err(e) = self.log.set_voted_for(args.candidate_id) {
                tracing::error!(node = self.id, error = %e, "Failed to persist vote");
                return RequestVoteReply {
                    term: self.log.current_term(),
                    vote_granted: false,
                };
            }
            Self::reset_election_timer(&mut state);
        }

        RequestVoteReply {
            term: self.log.current_term(),
            vote_granted,
        }
    }

    pub fn handle_append_entries(&self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.state.lock().unwrap();

        if args.term < self.log.current_term() {
            return AppendEntriesReply {
                term: self.log.current_term(),
                success: false,
                match_index: 0,
            };
        }

        self.become_follower(&mut state, args.term);
        state.leader_id = Some(args.leader_id);

        if args.prev_log_index > 0 && !self.log.matches_at(args.prev_log_index, args.prev_log_term)
        {
            return AppendEntriesReply {
                term: self.log.current_term(),
                success: false,
                match_index: 0,
            };
        }

        if !args.entries.is_empty() {
            // Truncate at the first conflicting index, then append what is
            // genuinely new.
            for entry in &args.entries {
                let existing = self.log.term_at(entry.index);
                if existing != 0 && existing != entry.term {
                    if let Err(e) = self.log.truncate_from(entry.index) {
                        tracing::error!(node = self.id, error = %e, "Failed to truncate conflicting log");
                        return AppendEntriesReply {
                            term: self.log.current_term(),
                            success: false,
                            match_index: 0,
                        };
                    }
                    break;
                }
            }
            for entry in &args.entries {
                if entry.index > self.log.last_index() {
                    if let Err(e) = self.log.append(entry.clone()) {
                        tracing::error!(node = self.id, error = %e, "Failed to append replicated entry");
                        return AppendEntriesReply {
                            term: self.log.current_term(),
                            success: false,
                            match_index: 0,
                        };
                    }
                }
            }
        }

        if args.leader_commit > state.commit_index {
            state.commit_index = args.leader_commit.min(self.log.last_index());
        }

        AppendEntriesReply {
            term: self.log.current_term(),
            success: true,
            match_index: self.log.last_index(),
        }
    }

    // ── Internals ──

    fn start_election(&self) -> Result<()> {
        let majority = self.cluster_size / 2 + 1;
        let args = {
            let mut state = self.state.lock().unwrap();
            let new_term = self.log.current_term() + 1;
            self.log.set_term(new_term)?;
            self.log.set_voted_for(self.id)?;
            state.role = RaftRole::Candidate;
            state.votes_received = 1; // own vote
            Self::reset_election_timer(&mut state);
            tracing::info!(node = self.id, term = new_term, "Starting election");

            if state.votes_received >= majority {
                self.become_leader(&mut state);
                return Ok(());
            }
            RequestVoteArgs {
                term: new_term,
                candidate_id: self.id,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            }
        };

        for peer in (0..self.cluster_size).filter(|&p| p != self.id) {
            let reply = match self.transport.request_vote(peer, &args) {
                Ok(reply) => reply,
                Err(_) => continue, // peer unreachable
            };

            let mut state = self.state.lock().unwrap();
            if state.role != RaftRole::Candidate {
                return Ok(());
            }
            if reply.term > self.log.current_term() {
                self.become_follower(&mut state, reply.term);
                return Ok(());
            }
            if reply.vote_granted {
                state.votes_received += 1;
                if state.votes_received >= majority {
                    self.become_leader(&mut state);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn send_heartbeats(&self) -> Result<()> {
        let batches: Vec<(u32, AppendEntriesArgs)> = {
            let state = self.state.lock().unwrap();
            if state.role != RaftRole::Leader {
                return Ok(());
            }
            (0..self.cluster_size)
                .filter(|&peer| peer != self.id)
                .map(|peer| {
                    let next = state.next_index[peer as usize];
                    let prev_log_index = next.saturating_sub(1);
                    let entries = if self.log.last_index() >= next {
                        self.log.entries_from(next)
                    } else {
                        Vec::new()
                    };
                    (
                        peer,
                        AppendEntriesArgs {
                            term: self.log.current_term(),
                            leader_id: self.id,
                            prev_log_index,
                            prev_log_term: self.log.term_at(prev_log_index),
                            entries,
                            leader_commit: state.commit_index,
                        },
                    )
                })
                .collect()
        };

        for (peer, args) in batches {
            let reply = match self.transport.append_entries(peer, &args) {
                Ok(reply) => reply,
                Err(_) => continue,
            };

            let mut state = self.state.lock().unwrap();
            if state.role != RaftRole::Leader {
                return Ok(());
            }
            if reply.term > self.log.current_term() {
                self.become_follower(&mut state, reply.term);
                return Ok(());
            }
            if reply.success {
                state.match_index[peer as usize] = reply.match_index;
                state.next_index[peer as usize] = reply.match_index + 1;
                self.try_advance_commit(&mut state);
            } else if state.next_index[peer as usize] > 1 {
                state.next_index[peer as usize] -= 1;
            }
        }
        Ok(())
    }

    /// Advances commit_index to the highest N replicated on a majority with
    /// an entry from the current term.
    fn try_advance_commit(&self, state: &mut Volatile) {
        let current_term = self.log.current_term();
        for n in ((state.commit_index + 1)..=self.log.last_index()).rev() {
            if self.log.term_at(n) != current_term {
                continue;
            }
            let replicas = 1 + (0..self.cluster_size)
                .filter(|&p| p != self.id && state.match_index[p as usize] >= n)
                .count() as u32;
            if replicas > self.cluster_size / 2 {
                state.commit_index = n;
                break;
            }
        }
    }

    fn become_follower(&self, state: &mut Volatile, term: u64) {
        if term > self.log.current_term() {
            if let Err(e) = self.log.set_term(term) {
                tracing::error!(node = self.id, error = %e, "Failed to persist term");
            }
        }
        if state.role != RaftRole::Follower {
            tracing::info!(node = self.id, term, "Stepping down to follower");
        }
        state.role = RaftRole::Follower;
        state.votes_received = 0;
        Self::reset_election_timer(state);
    }

    fn become_leader(&self, state: &mut Volatile) {
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.id);
        let next = self.log.last_index() + 1;
        state.next_index.iter_mut().for_each(|n| *n = next);
        state.match_index.iter_mut().for_each(|m| *m = 0);
        tracing::info!(node = self.id, term = self.log.current_term(), "Became leader");
    }

    fn reset_election_timer(state: &mut Volatile) {
        state.last_heartbeat = Instant::now();
        state.election_timeout = Self::random_timeout();
    }

    fn random_timeout() -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_MS))
    }
}

/// Drives elections and heartbeats.
pub struct RaftTickerTask {
    node: Arc<RaftNode>,
}

impl RaftTickerTask {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for RaftTickerTask {
    fn name(&self) -> &'static str {
        "raft-ticker"
    }

    fn interval(&self) -> Duration {
        TICK_INTERVAL
    }

    async fn execute(&self) -> Result<()> {
        self.node.tick();
        Ok(())
    }
}

/// Applies committed entries to the state machine.
pub struct RaftApplierTask {
    node: Arc<RaftNode>,
}

impl RaftApplierTask {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for RaftApplierTask {
    fn name(&self) -> &'static str {
        "raft-applier"
    }

    fn interval(&self) -> Duration {
        APPLY_INTERVAL
    }

    async fn execute(&self) -> Result<()> {
        self.node.apply_committed();
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        // Drain anything committed but not yet applied.
        self.node.apply_committed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::LocalTransport;
    use crate::tmpfs::TempDir;
    use std::sync::Mutex as StdMutex;

    fn cluster(
        transport: &Arc<LocalTransport>,
        dirs: &[TempDir],
    ) -> Vec<Arc<RaftNode>> {
        let size = dirs.len() as u32;
        let nodes: Vec<Arc<RaftNode>> = dirs
            .iter()
            .enumerate()
            .map(|(id, dir)| {
                let rpc: Arc<dyn RaftTransport> = transport.clone();
                RaftNode::new(id as u32, size, dir.path(), rpc).expect("create node")
            })
            .collect();
        for (id, node) in nodes.iter().enumerate() {
            transport.register(id as u32, node.clone());
        }
        nodes
    }

    #[test]
    fn test_single_node_elects_and_commits() -> Result<()> {
        let dirs = vec![TempDir::new().expect("dir")];
        let transport = LocalTransport::new();
        let nodes = cluster(&transport, &dirs);
        let node = &nodes[0];

        node.trigger_election()?;
        assert!(node.is_leader());
        assert_eq!(node.status().term, 1);

        let applied = Arc::new(StdMutex::new(Vec::new()));
        let sink = applied.clone();
        node.set_apply(Box::new(move |index, command| {
            sink.lock().unwrap().push((index, command.to_vec()));
        }));

        let index = node.propose(b"PUT k v".to_vec())?;
        assert_eq!(index, 1);
        assert_eq!(node.status().commit_index, 1);

        node.apply_committed();
        assert_eq!(*applied.lock().unwrap(), vec![(1, b"PUT k v".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_three_node_election_and_replication() -> Result<()> {
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().expect("dir")).collect();
        let transport = LocalTransport::new();
        let nodes = cluster(&transport, &dirs);

        nodes[0].trigger_election()?;
        assert!(nodes[0].is_leader());
        assert!(!nodes[1].is_leader());
        assert!(!nodes[2].is_leader());

        let applied: Vec<Arc<StdMutex<Vec<Vec<u8>>>>> =
            (0..3).map(|_| Arc::new(StdMutex::new(Vec::new()))).collect();
        for (node, sink) in nodes.iter().zip(&applied) {
            let sink = sink.clone();
            node.set_apply(Box::new(move |_, command| {
                sink.lock().unwrap().push(command.to_vec());
            }));
        }

        nodes[0].propose(b"PUT a 1".to_vec())?;
        nodes[0].propose(b"PUT b 2".to_vec())?;

        // First heartbeat replicates and advances the leader's commit;
        // the second propagates the commit index to followers.
        nodes[0].tick();
        nodes[0].tick();

        assert_eq!(nodes[0].status().commit_index, 2);
        assert_eq!(nodes[1].status().commit_index, 2);
        assert_eq!(nodes[2].status().commit_index, 2);

        for node in &nodes {
            node.apply_committed();
        }
        for sink in &applied {
            assert_eq!(*sink.lock().unwrap(), vec![b"PUT a 1".to_vec(), b"PUT b 2".to_vec()]);
        }
        Ok(())
    }

    #[test]
    fn test_propose_rejected_on_follower() -> Result<()> {
        let dirs = vec![TempDir::new().expect("dir"), TempDir::new().expect("dir")];
        let transport = LocalTransport::new();
        let nodes = cluster(&transport, &dirs);

        assert_eq!(nodes[1].propose(b"cmd".to_vec()), Err(Error::NotLeader));
        Ok(())
    }

    #[test]
    fn test_leader_steps_down_on_higher_term() -> Result<()> {
        let dirs = vec![TempDir::new().expect("dir")];
        let transport = LocalTransport::new();
        let nodes = cluster(&transport, &dirs);
        nodes[0].trigger_election()?;
        assert!(nodes[0].is_leader());

        let reply = nodes[0].handle_append_entries(&AppendEntriesArgs {
            term: 99,
            leader_id: 7,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        });
        assert!(reply.success);
        assert!(!nodes[0].is_leader());
        assert_eq!(nodes[0].status().term, 99);
        Ok(())
    }

    #[test]
    fn test_stale_term_rejected() -> Result<()> {
        let dirs = vec![TempDir::new().expect("dir")];
        let transport = LocalTransport::new();
        let nodes = cluster(&transport, &dirs);
        nodes[0].trigger_election()?; // term 1
        nodes[0].trigger_election()?; // term 2

        let reply = nodes[0].handle_request_vote(&RequestVoteArgs {
            term: 1,
            candidate_id: 5,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 2);
        Ok(())
    }

    #[test]
    fn test_conflicting_entries_truncated() -> Result<()> {
        let dirs = vec![TempDir::new().expect("dir")];
        let transport = LocalTransport::new();
        let nodes = cluster(&transport, &dirs);
        let node = &nodes[0];

        // Seed the log with term-1 entries via a fake leader.
        let seeded = node.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry { term: 1, index: 1, command: b"old1".to_vec() },
                LogEntry { term: 1, index: 2, command: b"old2".to_vec() },
            ],
            leader_commit: 0,
        });
        assert!(seeded.success);

        // A newer leader overwrites index 2 with a term-2 entry.
        let reply = node.handle_append_entries(&AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry { term: 2, index: 2, command: b"new2".to_vec() }],
            leader_commit: 0,
        });
        assert!(reply.success);
        assert_eq!(reply.match_index, 2);

        let status = node.status();
        assert_eq!(status.log_len, 2);
        Ok(())
    }

    #[test]
    fn test_vote_granted_once_per_term() -> Result<()> {
        let dirs = vec![TempDir::new().expect("dir")];
        let transport = LocalTransport::new();
        let nodes = cluster(&transport, &dirs);

        let args = |candidate| RequestVoteArgs {
            term: 5,
            candidate_id: candidate,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(nodes[0].handle_request_vote(&args(1)).vote_granted);
        // Same term, different candidate: refused.
        assert!(!nodes[0].handle_request_vote(&args(2)).vote_granted);
        // Same candidate again: idempotent grant.
        assert!(nodes[0].handle_request_vote(&args(1)).vote_granted);
        Ok(())
    }
}
