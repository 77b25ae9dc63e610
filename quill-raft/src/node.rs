//! The Raft consensus state machine.
//!
//! [`RaftNode`] is pure: it performs no I/O. Inputs are ticks, peer
//! messages, and proposals; the node returns [`RaftOutput`] actions that
//! the runtime executes. Persistence outputs come before the messages
//! that depend on them, so a runtime that executes outputs in order is
//! correct.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use quill_core::limits::APPEND_ENTRIES_BATCH_MAX;
use quill_core::{LogIndex, ServerId, Term};
use rand::Rng;
use tracing::debug;

use crate::config::RaftOptions;
use crate::entry::{Configuration, Entry, EntryKind};
use crate::log::RaftLog;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
use crate::storage::HardState;

/// A raft node's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftRole {
    /// Passive; responds to RPCs.
    #[default]
    Follower,
    /// Actively seeking votes.
    Candidate,
    /// Handles proposals, replicates the log.
    Leader,
}

/// Actions the runtime must execute on the node's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftOutput {
    /// Send a message to another node.
    SendMessage(Message),
    /// Persist the hard state before acting on anything after it.
    PersistHardState(HardState),
    /// Persist newly appended entries.
    PersistEntries(Vec<Entry>),
    /// Delete persisted entries with index >= `from` (conflict).
    TruncateLog {
        /// First index to delete.
        from: LogIndex,
    },
    /// An entry is committed; apply it.
    CommitEntry(Entry),
    /// The peer is behind the compaction point; ship it the latest
    /// snapshot.
    SendSnapshot {
        /// The peer to ship to.
        to: ServerId,
    },
    /// Install the snapshot carried by this request, then call
    /// [`RaftNode::snapshot_installed`].
    ApplySnapshot(InstallSnapshotRequest),
    /// This node became leader.
    BecameLeader,
    /// This node stepped down from leadership.
    SteppedDown,
}

/// A Raft consensus node.
pub struct RaftNode {
    options: RaftOptions,

    // Persistent state (mirrored to the stable store by the runtime).
    term: Term,
    voted_for: Option<ServerId>,
    log: RaftLog,

    // Volatile state.
    role: RaftRole,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<ServerId>,

    // Leader state, reinitialized after each election.
    next_index: HashMap<ServerId, LogIndex>,
    match_index: HashMap<ServerId, LogIndex>,

    // Candidate state.
    votes: HashSet<ServerId>,

    // Membership. `configuration` is the latest configuration in the log;
    // `fallback_configuration` is what we revert to if a truncation
    // removes every configuration entry from the window.
    configuration: Configuration,
    fallback_configuration: Configuration,

    // Tick-based timers.
    election_elapsed: u32,
    heartbeat_elapsed: u32,
    randomized_election_ticks: u32,
}

impl RaftNode {
    /// Creates a node from recovered state.
    #[must_use]
    pub fn new(
        options: RaftOptions,
        hard_state: HardState,
        log: RaftLog,
        configuration: Configuration,
    ) -> Self {
        let randomized_election_ticks = randomize(options.election_ticks);
        // Snapshot state is committed and applied by definition.
        let applied = log.snapshot_last_index();
        Self {
            options,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            role: RaftRole::Follower,
            commit_index: applied,
            last_applied: applied,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            fallback_configuration: configuration.clone(),
            configuration,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_ticks,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn id(&self) -> &ServerId {
        &self.options.local_id
    }

    /// The current term.
    #[must_use]
    pub const fn term(&self) -> Term {
        self.term
    }

    /// The current role.
    #[must_use]
    pub const fn role(&self) -> RaftRole {
        self.role
    }

    /// True when this node is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    /// The current leader, if known.
    #[must_use]
    pub const fn leader_id(&self) -> Option<&ServerId> {
        self.leader_id.as_ref()
    }

    /// The commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// The index of the last entry handed to the state machine.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// The latest cluster configuration.
    #[must_use]
    pub const fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// The in-memory log window.
    #[must_use]
    pub const fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Advances the node's timers by one tick.
    pub fn tick(&mut self) -> Vec<RaftOutput> {
        if self.role == RaftRole::Leader {
            self.heartbeat_elapsed += 1;
            if self.heartbeat_elapsed >= self.options.heartbeat_ticks {
                self.heartbeat_elapsed = 0;
                return self.broadcast_append_entries();
            }
            return Vec::new();
        }

        // Only voters disturb the cluster with elections.
        if !self.configuration.contains(&self.options.local_id) {
            return Vec::new();
        }

        self.election_elapsed += 1;
        if self.election_elapsed >= self.randomized_election_ticks {
            return self.start_election();
        }
        Vec::new()
    }

    /// Proposes a command. Returns the entry's index and the actions to
    /// execute, or `None` when this node is not the leader.
    pub fn propose(&mut self, kind: EntryKind, data: Bytes) -> Option<(LogIndex, Vec<RaftOutput>)> {
        if self.role != RaftRole::Leader {
            return None;
        }

        let index = self.log.last_index().next();
        let entry = Entry::new(self.term, index, kind, data);

        if entry.kind == EntryKind::Configuration {
            if let Some(config) = Configuration::decode(&entry.data) {
                self.set_configuration(config);
            }
        }

        self.log.append(entry.clone());

        let mut outputs = vec![RaftOutput::PersistEntries(vec![entry])];
        outputs.extend(self.broadcast_append_entries());
        outputs.extend(self.try_advance_commit());
        Some((index, outputs))
    }

    /// Proposes a configuration change. Returns `None` when not leader.
    pub fn propose_configuration(
        &mut self,
        configuration: &Configuration,
    ) -> Option<(LogIndex, Vec<RaftOutput>)> {
        self.propose(EntryKind::Configuration, configuration.encode())
    }

    /// Handles an incoming peer message.
    pub fn handle_message(&mut self, message: Message) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        // Leader stickiness: while we are hearing from a live leader, a
        // higher-term vote request does not disturb us. This keeps a
        // removed (or partitioned) server from deposing a healthy
        // leader with endless elections.
        if let Message::RequestVote(req) = &message {
            if req.term > self.term
                && self.leader_id.is_some()
                && self.election_elapsed < self.options.election_ticks
            {
                return vec![RaftOutput::SendMessage(Message::RequestVoteResponse(
                    RequestVoteResponse {
                        term: self.term,
                        from: self.options.local_id.clone(),
                        to: req.candidate_id.clone(),
                        vote_granted: false,
                    },
                ))];
            }
        }

        // A newer term always wins: step down first.
        if message.term() > self.term {
            outputs.extend(self.step_down(message.term()));
        }

        match message {
            Message::RequestVote(req) => outputs.extend(self.handle_request_vote(&req)),
            Message::RequestVoteResponse(resp) => {
                outputs.extend(self.handle_request_vote_response(&resp));
            }
            Message::AppendEntries(req) => outputs.extend(self.handle_append_entries(req)),
            Message::AppendEntriesResponse(resp) => {
                outputs.extend(self.handle_append_entries_response(&resp));
            }
            Message::InstallSnapshot(req) => outputs.extend(self.handle_install_snapshot(req)),
            Message::InstallSnapshotResponse(resp) => {
                outputs.extend(self.handle_snapshot_response(&resp));
            }
        }

        outputs
    }

    /// Completes a snapshot install after the runtime restored the state
    /// machine. Returns the response to send to the leader.
    pub fn snapshot_installed(
        &mut self,
        last_index: LogIndex,
        last_term: Term,
        configuration: Configuration,
        leader: &ServerId,
    ) -> Vec<RaftOutput> {
        self.log.install_snapshot(last_index, last_term);
        self.commit_index = last_index;
        self.last_applied = last_index;
        self.fallback_configuration = configuration.clone();
        self.set_configuration(configuration);

        vec![RaftOutput::SendMessage(Message::InstallSnapshotResponse(
            InstallSnapshotResponse {
                term: self.term,
                from: self.options.local_id.clone(),
                to: leader.clone(),
                match_index: last_index,
            },
        ))]
    }

    /// Records that entries through `through` were folded into a snapshot,
    /// compacting the in-memory window.
    pub fn compacted(&mut self, through: LogIndex) {
        let term = self.log.term_at(through).unwrap_or_default();
        self.log.compact_through(through, term);
        self.fallback_configuration = self.configuration.clone();
    }

    fn start_election(&mut self) -> Vec<RaftOutput> {
        self.term = self.term.next();
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.options.local_id.clone());
        self.votes.clear();
        self.votes.insert(self.options.local_id.clone());
        self.leader_id = None;
        self.rearm_election_timer();

        debug!(term = self.term.get(), id = %self.options.local_id, "starting election");

        let mut outputs = vec![RaftOutput::PersistHardState(self.hard_state())];

        for peer in self.configuration.peers_of(&self.options.local_id) {
            outputs.push(RaftOutput::SendMessage(Message::RequestVote(
                RequestVoteRequest {
                    term: self.term,
                    candidate_id: self.options.local_id.clone(),
                    to: peer.id,
                    last_log_index: self.log.last_index(),
                    last_log_term: self.log.last_term(),
                },
            )));
        }

        // A single-voter cluster elects itself immediately.
        if self.votes.len() >= self.configuration.quorum() {
            outputs.extend(self.become_leader());
        }

        outputs
    }

    fn become_leader(&mut self) -> Vec<RaftOutput> {
        debug_assert!(self.votes.len() >= self.configuration.quorum());

        self.role = RaftRole::Leader;
        self.leader_id = Some(self.options.local_id.clone());
        self.heartbeat_elapsed = 0;

        let next = self.log.last_index().next();
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.configuration.peers_of(&self.options.local_id) {
            self.next_index.insert(peer.id.clone(), next);
            self.match_index.insert(peer.id, LogIndex::new(0));
        }

        debug!(term = self.term.get(), id = %self.options.local_id, "became leader");

        let mut outputs = vec![RaftOutput::BecameLeader];

        // Establish leadership with a no-op entry so entries from earlier
        // terms become committable (the current-term commit rule).
        let noop = Entry::new(
            self.term,
            self.log.last_index().next(),
            EntryKind::Noop,
            Bytes::new(),
        );
        self.log.append(noop.clone());
        outputs.push(RaftOutput::PersistEntries(vec![noop]));

        outputs.extend(self.broadcast_append_entries());
        outputs.extend(self.try_advance_commit());
        outputs
    }

    fn step_down(&mut self, new_term: Term) -> Vec<RaftOutput> {
        let was_leader = self.role == RaftRole::Leader;
        self.term = new_term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.votes.clear();
        self.rearm_election_timer();

        let mut outputs = vec![RaftOutput::PersistHardState(self.hard_state())];
        if was_leader {
            outputs.push(RaftOutput::SteppedDown);
        }
        outputs
    }

    fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        let grant = req.term >= self.term
            && self
                .voted_for
                .as_ref()
                .map_or(true, |id| id == &req.candidate_id)
            && self.log.is_up_to_date(req.last_log_term, req.last_log_index);

        if grant {
            self.voted_for = Some(req.candidate_id.clone());
            self.rearm_election_timer();
            outputs.push(RaftOutput::PersistHardState(self.hard_state()));
        }

        outputs.push(RaftOutput::SendMessage(Message::RequestVoteResponse(
            RequestVoteResponse {
                term: self.term,
                from: self.options.local_id.clone(),
                to: req.candidate_id.clone(),
                vote_granted: grant,
            },
        )));
        outputs
    }

    fn handle_request_vote_response(&mut self, resp: &RequestVoteResponse) -> Vec<RaftOutput> {
        if self.role != RaftRole::Candidate || resp.term != self.term {
            return Vec::new();
        }

        if resp.vote_granted {
            self.votes.insert(resp.from.clone());
            if self.votes.len() >= self.configuration.quorum() {
                return self.become_leader();
            }
        }
        Vec::new()
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if req.term < self.term {
            outputs.push(self.append_response(&req.leader_id, false));
            return outputs;
        }

        if self.role == RaftRole::Candidate {
            self.role = RaftRole::Follower;
            self.votes.clear();
        }
        self.leader_id = Some(req.leader_id.clone());
        self.rearm_election_timer();

        // Entries at or below the compaction point are committed ground
        // truth; only the window above it needs the consistency check.
        let log_ok = req.prev_log_index <= self.log.snapshot_last_index()
            || self.log.term_at(req.prev_log_index) == Some(req.prev_log_term);

        if !log_ok {
            outputs.push(self.append_response(&req.leader_id, false));
            return outputs;
        }

        // Append, resolving conflicts by truncating our suffix.
        let mut appended = Vec::new();
        for entry in req.entries {
            if entry.index <= self.log.snapshot_last_index() {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue, // already have it
                Some(_) => {
                    // Conflict: drop our suffix, then take the leader's.
                    self.log.truncate_from(entry.index);
                    self.rescan_configuration();
                    outputs.push(RaftOutput::TruncateLog { from: entry.index });
                }
                None => {}
            }
            if entry.kind == EntryKind::Configuration {
                if let Some(config) = Configuration::decode(&entry.data) {
                    self.set_configuration(config);
                }
            }
            self.log.append(entry.clone());
            appended.push(entry);
        }
        if !appended.is_empty() {
            outputs.push(RaftOutput::PersistEntries(appended));
        }

        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(self.log.last_index());
            outputs.extend(self.advance_commit(new_commit));
        }

        outputs.push(self.append_response(&req.leader_id, true));
        outputs
    }

    fn append_response(&self, to: &ServerId, success: bool) -> RaftOutput {
        RaftOutput::SendMessage(Message::AppendEntriesResponse(AppendEntriesResponse {
            term: self.term,
            from: self.options.local_id.clone(),
            to: to.clone(),
            success,
            match_index: self.log.last_index(),
        }))
    }

    fn handle_append_entries_response(
        &mut self,
        resp: &AppendEntriesResponse,
    ) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader || resp.term != self.term {
            return Vec::new();
        }

        if resp.success {
            self.match_index.insert(resp.from.clone(), resp.match_index);
            self.next_index
                .insert(resp.from.clone(), resp.match_index.next());
            return self.try_advance_commit();
        }

        // Back next_index off and retry immediately.
        let next = self
            .next_index
            .get(&resp.from)
            .copied()
            .unwrap_or(LogIndex::new(1));
        if next.get() > 1 {
            self.next_index
                .insert(resp.from.clone(), LogIndex::new(next.get() - 1));
        }
        self.send_append_entries(&resp.from)
    }

    fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> Vec<RaftOutput> {
        if req.term < self.term {
            return vec![RaftOutput::SendMessage(Message::InstallSnapshotResponse(
                InstallSnapshotResponse {
                    term: self.term,
                    from: self.options.local_id.clone(),
                    to: req.leader_id.clone(),
                    match_index: self.log.last_index(),
                },
            ))];
        }

        self.leader_id = Some(req.leader_id.clone());
        self.rearm_election_timer();

        if req.last_index <= self.log.last_index() {
            // Nothing to install; we already have everything it covers.
            return vec![RaftOutput::SendMessage(Message::InstallSnapshotResponse(
                InstallSnapshotResponse {
                    term: self.term,
                    from: self.options.local_id.clone(),
                    to: req.leader_id.clone(),
                    match_index: self.log.last_index(),
                },
            ))];
        }

        // The runtime restores the state machine and then calls
        // `snapshot_installed`.
        vec![RaftOutput::ApplySnapshot(req)]
    }

    fn handle_snapshot_response(&mut self, resp: &InstallSnapshotResponse) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader || resp.term != self.term {
            return Vec::new();
        }
        self.match_index.insert(resp.from.clone(), resp.match_index);
        self.next_index
            .insert(resp.from.clone(), resp.match_index.next());
        self.try_advance_commit()
    }

    fn broadcast_append_entries(&mut self) -> Vec<RaftOutput> {
        let peers: Vec<ServerId> = self
            .configuration
            .peers_of(&self.options.local_id)
            .into_iter()
            .map(|s| s.id)
            .collect();

        let mut outputs = Vec::new();
        for peer in peers {
            outputs.extend(self.send_append_entries(&peer));
        }
        outputs
    }

    fn send_append_entries(&self, peer: &ServerId) -> Vec<RaftOutput> {
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or_else(|| self.log.last_index().next());

        // A peer behind the compaction point needs the snapshot instead.
        if next <= self.log.snapshot_last_index() {
            return vec![RaftOutput::SendSnapshot { to: peer.clone() }];
        }

        let prev = LogIndex::new(next.get().saturating_sub(1));
        let Some(prev_term) = self.log.term_at(prev) else {
            return vec![RaftOutput::SendSnapshot { to: peer.clone() }];
        };

        vec![RaftOutput::SendMessage(Message::AppendEntries(
            AppendEntriesRequest {
                term: self.term,
                leader_id: self.options.local_id.clone(),
                to: peer.clone(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries: self.log.entries_from(next, APPEND_ENTRIES_BATCH_MAX),
                leader_commit: self.commit_index,
            },
        ))]
    }

    fn try_advance_commit(&mut self) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }

        let mut outputs = Vec::new();
        for n in (self.commit_index.get() + 1)..=self.log.last_index().get() {
            let idx = LogIndex::new(n);

            // Only entries of the current term commit by counting
            // replicas; older entries commit with them.
            if self.log.term_at(idx) != Some(self.term) {
                continue;
            }

            let mut count = usize::from(self.configuration.contains(&self.options.local_id));
            for server in &self.configuration.servers {
                if server.id == self.options.local_id {
                    continue;
                }
                if self.match_index.get(&server.id).copied().unwrap_or_default() >= idx {
                    count += 1;
                }
            }

            if count >= self.configuration.quorum() {
                outputs.extend(self.advance_commit(idx));
            }
        }
        outputs
    }

    fn advance_commit(&mut self, new_commit: LogIndex) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if new_commit <= self.commit_index {
            return outputs;
        }
        self.commit_index = new_commit;

        while self.last_applied < self.commit_index {
            let idx = self.last_applied.next();
            if let Some(entry) = self.log.get(idx) {
                let entry = entry.clone();
                if entry.kind == EntryKind::Configuration
                    && self.role == RaftRole::Leader
                    && !self.configuration.contains(&self.options.local_id)
                {
                    // We were removed from the cluster; stop leading.
                    self.role = RaftRole::Follower;
                    self.leader_id = None;
                    outputs.push(RaftOutput::SteppedDown);
                }
                outputs.push(RaftOutput::CommitEntry(entry));
            }
            self.last_applied = idx;
        }
        outputs
    }

    /// Applies a new configuration and prunes leader bookkeeping for
    /// servers that left.
    fn set_configuration(&mut self, configuration: Configuration) {
        let next = self.log.last_index().next();
        for server in &configuration.servers {
            if server.id == self.options.local_id {
                continue;
            }
            self.next_index.entry(server.id.clone()).or_insert(next);
            self.match_index
                .entry(server.id.clone())
                .or_insert(LogIndex::new(0));
        }
        self.next_index
            .retain(|id, _| configuration.contains(id));
        self.match_index
            .retain(|id, _| configuration.contains(id));
        self.configuration = configuration;
    }

    /// Re-derives the configuration after a suffix truncation.
    fn rescan_configuration(&mut self) {
        let mut found = None;
        let first = self.log.snapshot_last_index().next();
        for n in (first.get()..=self.log.last_index().get()).rev() {
            if let Some(entry) = self.log.get(LogIndex::new(n)) {
                if entry.kind == EntryKind::Configuration {
                    found = Configuration::decode(&entry.data);
                    break;
                }
            }
        }
        let config = found.unwrap_or_else(|| self.fallback_configuration.clone());
        self.set_configuration(config);
    }

    fn rearm_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.randomized_election_ticks = randomize(self.options.election_ticks);
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
        }
    }
}

/// Draws an election timeout in `[base, 2 * base)` ticks.
fn randomize(base: u32) -> u32 {
    rand::thread_rng().gen_range(base..base * 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Server;

    fn config_of(ids: &[&str]) -> Configuration {
        Configuration {
            servers: ids
                .iter()
                .map(|id| Server {
                    id: ServerId::new(*id),
                    addr: format!("{id}:9000"),
                })
                .collect(),
        }
    }

    fn node(id: &str, cluster: &[&str]) -> RaftNode {
        RaftNode::new(
            RaftOptions::new(ServerId::new(id)).with_election_ticks(5),
            HardState::default(),
            RaftLog::new(),
            config_of(cluster),
        )
    }

    fn tick_until_election(node: &mut RaftNode) -> Vec<RaftOutput> {
        for _ in 0..10 {
            let outputs = node.tick();
            if !outputs.is_empty() {
                return outputs;
            }
        }
        panic!("no election after 10 ticks");
    }

    fn grant_vote(node: &mut RaftNode, from: &str) -> Vec<RaftOutput> {
        node.handle_message(Message::RequestVoteResponse(RequestVoteResponse {
            term: node.term(),
            from: ServerId::new(from),
            to: node.id().clone(),
            vote_granted: true,
        }))
    }

    #[test]
    fn test_new_node_is_follower() {
        let node = node("a", &["a", "b", "c"]);
        assert_eq!(node.role(), RaftRole::Follower);
        assert_eq!(node.term(), Term::new(0));
        assert!(node.leader_id().is_none());
    }

    #[test]
    fn test_election_timeout_starts_election() {
        let mut node = node("a", &["a", "b", "c"]);
        let outputs = tick_until_election(&mut node);

        assert_eq!(node.role(), RaftRole::Candidate);
        assert_eq!(node.term(), Term::new(1));

        let votes = outputs
            .iter()
            .filter(|o| matches!(o, RaftOutput::SendMessage(Message::RequestVote(_))))
            .count();
        assert_eq!(votes, 2);

        // The term bump is persisted before any message goes out.
        assert!(matches!(outputs[0], RaftOutput::PersistHardState(_)));
    }

    #[test]
    fn test_non_voter_never_starts_election() {
        let mut node = node("d", &["a", "b", "c"]);
        for _ in 0..50 {
            assert!(node.tick().is_empty());
        }
        assert_eq!(node.role(), RaftRole::Follower);
    }

    #[test]
    fn test_becomes_leader_with_quorum_and_appends_noop() {
        let mut node = node("a", &["a", "b", "c"]);
        tick_until_election(&mut node);

        let outputs = grant_vote(&mut node, "b");
        assert!(node.is_leader());
        assert!(outputs.iter().any(|o| matches!(o, RaftOutput::BecameLeader)));

        // Leadership is established with a noop entry.
        assert_eq!(node.log().last_index(), LogIndex::new(1));
        assert_eq!(node.log().get(LogIndex::new(1)).unwrap().kind, EntryKind::Noop);
    }

    #[test]
    fn test_single_node_cluster_elects_and_commits_alone() {
        let mut node = node("a", &["a"]);
        let outputs = tick_until_election(&mut node);
        assert!(node.is_leader());
        // The noop commits immediately at quorum 1.
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry(e) if e.kind == EntryKind::Noop)));

        let (index, outputs) = node
            .propose(EntryKind::Command, Bytes::from("cmd"))
            .unwrap();
        assert_eq!(index, LogIndex::new(2));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry(e) if e.index == index)));
    }

    #[test]
    fn test_propose_on_follower_returns_none() {
        let mut node = node("a", &["a", "b", "c"]);
        assert!(node.propose(EntryKind::Command, Bytes::from("x")).is_none());
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mut node = node("a", &["a", "b", "c"]);

        let req = |candidate: &str| {
            Message::RequestVote(RequestVoteRequest {
                term: Term::new(1),
                candidate_id: ServerId::new(candidate),
                to: ServerId::new("a"),
                last_log_index: LogIndex::new(0),
                last_log_term: Term::new(0),
            })
        };

        let outputs = node.handle_message(req("b"));
        let granted = outputs.iter().any(|o| {
            matches!(o, RaftOutput::SendMessage(Message::RequestVoteResponse(r)) if r.vote_granted)
        });
        assert!(granted);

        let outputs = node.handle_message(req("c"));
        let granted = outputs.iter().any(|o| {
            matches!(o, RaftOutput::SendMessage(Message::RequestVoteResponse(r)) if r.vote_granted)
        });
        assert!(!granted);
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let mut node = node("a", &["a", "b", "c"]);
        // Give ourselves an entry at term 2.
        node.term = Term::new(2);
        node.log.append(Entry::new(
            Term::new(2),
            LogIndex::new(1),
            EntryKind::Command,
            Bytes::from("x"),
        ));

        let outputs = node.handle_message(Message::RequestVote(RequestVoteRequest {
            term: Term::new(3),
            candidate_id: ServerId::new("b"),
            to: ServerId::new("a"),
            last_log_index: LogIndex::new(0),
            last_log_term: Term::new(0),
        }));
        let granted = outputs.iter().any(|o| {
            matches!(o, RaftOutput::SendMessage(Message::RequestVoteResponse(r)) if r.vote_granted)
        });
        assert!(!granted);
    }

    #[test]
    fn test_append_entries_adopts_leader_and_replies() {
        let mut node = node("a", &["a", "b", "c"]);

        let entry = Entry::new(
            Term::new(1),
            LogIndex::new(1),
            EntryKind::Command,
            Bytes::from("data"),
        );
        let outputs = node.handle_message(Message::AppendEntries(AppendEntriesRequest {
            term: Term::new(1),
            leader_id: ServerId::new("b"),
            to: ServerId::new("a"),
            prev_log_index: LogIndex::new(0),
            prev_log_term: Term::new(0),
            entries: vec![entry.clone()],
            leader_commit: LogIndex::new(0),
        }));

        assert_eq!(node.leader_id(), Some(&ServerId::new("b")));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::PersistEntries(e) if e == &vec![entry.clone()])));
        let success = outputs.iter().any(|o| {
            matches!(o, RaftOutput::SendMessage(Message::AppendEntriesResponse(r)) if r.success)
        });
        assert!(success);
    }

    #[test]
    fn test_append_entries_rejects_gap() {
        let mut node = node("a", &["a", "b", "c"]);

        let outputs = node.handle_message(Message::AppendEntries(AppendEntriesRequest {
            term: Term::new(1),
            leader_id: ServerId::new("b"),
            to: ServerId::new("a"),
            prev_log_index: LogIndex::new(5),
            prev_log_term: Term::new(1),
            entries: vec![],
            leader_commit: LogIndex::new(0),
        }));

        let success = outputs.iter().any(|o| {
            matches!(o, RaftOutput::SendMessage(Message::AppendEntriesResponse(r)) if r.success)
        });
        assert!(!success);
    }

    #[test]
    fn test_conflicting_suffix_is_truncated() {
        let mut node = node("a", &["a", "b", "c"]);

        // Local entries from an old leader at term 1.
        for i in 1..=2 {
            node.log.append(Entry::new(
                Term::new(1),
                LogIndex::new(i),
                EntryKind::Command,
                Bytes::from("old"),
            ));
        }

        // The new leader overwrites index 2 at term 2.
        let outputs = node.handle_message(Message::AppendEntries(AppendEntriesRequest {
            term: Term::new(2),
            leader_id: ServerId::new("b"),
            to: ServerId::new("a"),
            prev_log_index: LogIndex::new(1),
            prev_log_term: Term::new(1),
            entries: vec![Entry::new(
                Term::new(2),
                LogIndex::new(2),
                EntryKind::Command,
                Bytes::from("new"),
            )],
            leader_commit: LogIndex::new(0),
        }));

        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::TruncateLog { from } if from.get() == 2)));
        assert_eq!(
            node.log().get(LogIndex::new(2)).unwrap().data,
            Bytes::from("new")
        );
    }

    #[test]
    fn test_step_down_on_higher_term() {
        let mut node = node("a", &["a", "b", "c"]);
        tick_until_election(&mut node);
        grant_vote(&mut node, "b");
        assert!(node.is_leader());

        let outputs = node.handle_message(Message::AppendEntries(AppendEntriesRequest {
            term: Term::new(9),
            leader_id: ServerId::new("c"),
            to: ServerId::new("a"),
            prev_log_index: LogIndex::new(0),
            prev_log_term: Term::new(0),
            entries: vec![],
            leader_commit: LogIndex::new(0),
        }));

        assert_eq!(node.role(), RaftRole::Follower);
        assert_eq!(node.term(), Term::new(9));
        assert!(outputs.iter().any(|o| matches!(o, RaftOutput::SteppedDown)));
    }

    #[test]
    fn test_commit_requires_quorum_replication() {
        let mut node = node("a", &["a", "b", "c"]);
        tick_until_election(&mut node);
        grant_vote(&mut node, "b");

        let (index, outputs) = node
            .propose(EntryKind::Command, Bytes::from("cmd"))
            .unwrap();
        // Nothing is committed before a follower acknowledges.
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry(_))));

        let outputs = node.handle_message(Message::AppendEntriesResponse(AppendEntriesResponse {
            term: node.term(),
            from: ServerId::new("b"),
            to: ServerId::new("a"),
            success: true,
            match_index: index,
        }));

        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry(e) if e.index == index)));
        assert_eq!(node.commit_index(), index);
    }

    #[test]
    fn test_configuration_change_takes_effect_on_append() {
        let mut node = node("a", &["a"]);
        tick_until_election(&mut node);
        assert!(node.is_leader());

        let grown = config_of(&["a", "b"]);
        let (_, _) = node.propose_configuration(&grown).unwrap();

        assert!(node.configuration().contains(&ServerId::new("b")));
        // Quorum is now 2: a lone proposal no longer commits.
        let (_, outputs) = node.propose(EntryKind::Command, Bytes::from("x")).unwrap();
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry(e) if e.kind == EntryKind::Command)));
    }

    #[test]
    fn test_removed_leader_steps_down_on_commit() {
        let mut node = node("a", &["a"]);
        tick_until_election(&mut node);

        let shrunk = config_of(&["b"]);
        let (_, outputs) = node.propose_configuration(&shrunk).unwrap();

        // The new configuration takes effect on append: this node no
        // longer counts itself toward quorum, so nothing commits until
        // the remaining voter acknowledges.
        assert!(!node.configuration().contains(&ServerId::new("a")));
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry(_))));
    }

    #[test]
    fn test_follower_behind_compaction_gets_snapshot() {
        let mut node = node("a", &["a", "b"]);
        tick_until_election(&mut node);
        grant_vote(&mut node, "b");
        assert!(node.is_leader());

        for _ in 0..4 {
            node.propose(EntryKind::Command, Bytes::from("x")).unwrap();
        }
        node.compacted(LogIndex::new(3));

        // Pretend b never acked anything: next_index falls to 1.
        for _ in 0..6 {
            node.handle_message(Message::AppendEntriesResponse(AppendEntriesResponse {
                term: node.term(),
                from: ServerId::new("b"),
                to: ServerId::new("a"),
                success: false,
                match_index: LogIndex::new(0),
            }));
        }

        let outputs = node.tick();
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::SendSnapshot { to } if to == &ServerId::new("b"))));
    }

    #[test]
    fn test_install_snapshot_flow() {
        let mut node = node("a", &["a", "b"]);

        let config = config_of(&["a", "b"]);
        let req = InstallSnapshotRequest {
            term: Term::new(3),
            leader_id: ServerId::new("b"),
            to: ServerId::new("a"),
            last_index: LogIndex::new(10),
            last_term: Term::new(3),
            configuration: Bytes::from(config.encode()),
            data: Bytes::from("snapshot"),
        };

        let outputs = node.handle_message(Message::InstallSnapshot(req.clone()));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::ApplySnapshot(r) if r == &req)));

        let outputs =
            node.snapshot_installed(LogIndex::new(10), Term::new(3), config, &ServerId::new("b"));
        assert_eq!(node.log().last_index(), LogIndex::new(10));
        assert_eq!(node.commit_index(), LogIndex::new(10));
        assert!(matches!(
            &outputs[0],
            RaftOutput::SendMessage(Message::InstallSnapshotResponse(r)) if r.match_index.get() == 10
        ));
    }
}
