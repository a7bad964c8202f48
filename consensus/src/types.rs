//! Identifiers and records shared by the log, the protocol and the driver.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::membership::Membership;

/// Identifier of a cluster member.
pub type NodeId = u64;

/// Monotonically increasing election epoch.
pub type Term = u64;

/// 1-based position in the replicated log. Zero means "no entry".
pub type LogIndex = u64;

/// Bound for the commands a state machine accepts through the log.
pub trait Command: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Command for T where T: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum EntryPayload<C> {
    /// No-op appended by a new leader, and used as a read barrier.
    Blank,

    /// A client command for the state machine.
    Command(C),

    /// The complete cluster configuration that takes effect once committed.
    Membership(Membership),
}

/// A single record in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<C> {
    /// Position in the log.
    pub index: LogIndex,
    /// Term of the leader that created the entry.
    pub term: Term,
    /// Entry contents.
    pub payload: EntryPayload<C>,
}

impl<C> Entry<C> {
    /// Create a new entry.
    pub fn new(index: LogIndex, term: Term, payload: EntryPayload<C>) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}

/// Durable protocol state which must survive restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HardState {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate this node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
    /// Highest index known to be committed.
    pub commit_index: LogIndex,
}

/// A compacted prefix of the log: state machine contents plus the
/// configuration in force at `index`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    /// Last log index covered by the snapshot.
    pub index: LogIndex,
    /// Term of the entry at `index`.
    pub term: Term,
    /// Cluster configuration as of `index`.
    pub membership: Membership,
    /// Opaque state machine image.
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("index", &self.index)
            .field("term", &self.term)
            .field("membership", &self.membership)
            .field("data", &format_args!("{} bytes", self.data.len()))
            .finish()
    }
}

/// Role a node plays in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Passive replica following a leader.
    Follower,
    /// Probing whether an election could succeed, without bumping the term.
    PreCandidate,
    /// Requesting votes for a new term.
    Candidate,
    /// Accepting proposals and replicating the log.
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => f.write_str("follower"),
            Role::PreCandidate => f.write_str("pre-candidate"),
            Role::Candidate => f.write_str("candidate"),
            Role::Leader => f.write_str("leader"),
        }
    }
}
