//! Peer-to-peer protocol messages.

use serde::{Deserialize, Serialize};

use crate::types::{Entry, LogIndex, NodeId, Snapshot, Term};

/// Ask a peer for its vote, or with `pre_vote` whether it would vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Term the candidate is campaigning for.
    pub term: Term,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
    /// Whether this is a pre-vote probe which does not change any term.
    pub pre_vote: bool,
}

/// Answer to a [`VoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's term, or the probed term for a granted pre-vote.
    pub term: Term,
    /// Whether the vote was granted.
    pub granted: bool,
    /// Whether this answers a pre-vote probe.
    pub pre_vote: bool,
}

/// Replicate entries, or an empty heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest<C> {
    /// Leader's term.
    pub term: Term,
    /// Index of the entry preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to append, possibly empty.
    pub entries: Vec<Entry<C>>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// Answer to an [`AppendEntriesRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Responder's term.
    pub term: Term,
    /// Whether the entries were accepted.
    pub success: bool,
    /// On success, the highest index known to match the leader.
    pub match_index: LogIndex,
    /// On rejection, where the leader should resume replication.
    pub conflict_index: LogIndex,
}

/// Replace a lagging follower's log prefix with a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// The snapshot to install.
    pub snapshot: Snapshot,
}

/// Answer to an [`InstallSnapshotRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Responder's term.
    pub term: Term,
    /// Highest index the responder now holds.
    pub last_index: LogIndex,
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message<C> {
    /// Vote or pre-vote request.
    RequestVote(VoteRequest),
    /// Vote or pre-vote response.
    RequestVoteResponse(VoteResponse),
    /// Replication or heartbeat.
    AppendEntries(AppendEntriesRequest<C>),
    /// Replication acknowledgement.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Snapshot transfer.
    InstallSnapshot(InstallSnapshotRequest),
    /// Snapshot acknowledgement.
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl<C> Message<C> {
    /// The term carried by the message.
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotResponse(m) => m.term,
        }
    }

    /// Short name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(m) if m.pre_vote => "pre-vote",
            Message::RequestVote(_) => "request-vote",
            Message::RequestVoteResponse(m) if m.pre_vote => "pre-vote-response",
            Message::RequestVoteResponse(_) => "request-vote-response",
            Message::AppendEntries(_) => "append-entries",
            Message::AppendEntriesResponse(_) => "append-entries-response",
            Message::InstallSnapshot(_) => "install-snapshot",
            Message::InstallSnapshotResponse(_) => "install-snapshot-response",
        }
    }
}

/// A message addressed between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<C> {
    /// Sender.
    pub from: NodeId,
    /// Recipient.
    pub to: NodeId,
    /// Payload.
    pub message: Message<C>,
}
