//! Raft RPC message types.

use bytes::Bytes;
use quill_core::{LogIndex, ServerId, Term};

use crate::entry::Entry;

/// Raft messages exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request a vote during an election.
    RequestVote(RequestVoteRequest),
    /// Response to a vote request.
    RequestVoteResponse(RequestVoteResponse),
    /// Replicate entries (also the heartbeat when empty).
    AppendEntries(AppendEntriesRequest),
    /// Response to append entries.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Ship a whole snapshot to a follower behind the compaction point.
    InstallSnapshot(InstallSnapshotRequest),
    /// Response to a snapshot install.
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl Message {
    /// The sender of this message.
    #[must_use]
    pub const fn from(&self) -> &ServerId {
        match self {
            Self::RequestVote(r) => &r.candidate_id,
            Self::RequestVoteResponse(r) => &r.from,
            Self::AppendEntries(r) => &r.leader_id,
            Self::AppendEntriesResponse(r) => &r.from,
            Self::InstallSnapshot(r) => &r.leader_id,
            Self::InstallSnapshotResponse(r) => &r.from,
        }
    }

    /// The destination of this message.
    #[must_use]
    pub const fn to(&self) -> &ServerId {
        match self {
            Self::RequestVote(r) => &r.to,
            Self::RequestVoteResponse(r) => &r.to,
            Self::AppendEntries(r) => &r.to,
            Self::AppendEntriesResponse(r) => &r.to,
            Self::InstallSnapshot(r) => &r.to,
            Self::InstallSnapshotResponse(r) => &r.to,
        }
    }

    /// The term the message was sent in.
    #[must_use]
    pub const fn term(&self) -> Term {
        match self {
            Self::RequestVote(r) => r.term,
            Self::RequestVoteResponse(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::AppendEntriesResponse(r) => r.term,
            Self::InstallSnapshot(r) => r.term,
            Self::InstallSnapshotResponse(r) => r.term,
        }
    }
}

/// `RequestVote` RPC request, sent by candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: ServerId,
    /// Target node.
    pub to: ServerId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// `RequestVote` RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Voter's current term.
    pub term: Term,
    /// The voter.
    pub from: ServerId,
    /// The candidate.
    pub to: ServerId,
    /// True if the vote was granted.
    pub vote_granted: bool,
}

/// `AppendEntries` RPC request; an empty `entries` is the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader.
    pub leader_id: ServerId,
    /// Target node.
    pub to: ServerId,
    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the `prev_log_index` entry.
    pub prev_log_term: Term,
    /// Entries to append.
    pub entries: Vec<Entry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// `AppendEntries` RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Follower's current term.
    pub term: Term,
    /// The follower.
    pub from: ServerId,
    /// The leader.
    pub to: ServerId,
    /// True if the follower's log matched and entries were appended.
    pub success: bool,
    /// The follower's last log index, for next-index bookkeeping.
    pub match_index: LogIndex,
}

/// `InstallSnapshot` RPC request: the whole snapshot in one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader.
    pub leader_id: ServerId,
    /// Target node.
    pub to: ServerId,
    /// Index of the last entry covered by the snapshot.
    pub last_index: LogIndex,
    /// Term of that entry.
    pub last_term: Term,
    /// The configuration at the snapshot point, encoded.
    pub configuration: Bytes,
    /// The snapshot payload.
    pub data: Bytes,
}

/// `InstallSnapshot` RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    /// Follower's current term.
    pub term: Term,
    /// The follower.
    pub from: ServerId,
    /// The leader.
    pub to: ServerId,
    /// The follower's last log index after the install.
    pub match_index: LogIndex,
}
