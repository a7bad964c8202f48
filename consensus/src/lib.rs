//! # Replicated log consensus
//!
//! A leader-based consensus core in the Raft family, used to replicate an
//! ordered log of commands across a small cluster of nodes and apply them to
//! a deterministic [`StateMachine`] on every member.
//!
//! The crate is split into a pure protocol machine ([`Raft`]) which consumes
//! ticks, peer messages and proposals and emits a [`Ready`] batch of work, and
//! an async driver ([`RaftNode`]) which persists that work through a
//! [`LogStore`], ships messages over a [`Transport`] and feeds committed
//! entries into the state machine.
//!
//! ## Example
//!
//! ```no_run
//! use consensus::{Member, Membership, MemoryNetwork, MemoryStore, RaftConfig, RaftNode};
//! # use consensus::{LogIndex, StateMachine, BoxError};
//! # #[derive(Debug, Default)]
//! # struct Counter(u64);
//! # impl StateMachine for Counter {
//! #     type Command = u64;
//! #     type Output = u64;
//! #     fn apply(&mut self, _: LogIndex, command: &u64) -> u64 { self.0 += command; self.0 }
//! #     fn snapshot(&self) -> Result<Vec<u8>, BoxError> { Ok(self.0.to_be_bytes().to_vec()) }
//! #     fn restore(&mut self, _: &[u8]) -> Result<(), BoxError> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let membership = Membership::new([Member::voter(1, "node-1")]);
//! let handle = RaftNode::new(1, RaftConfig::default())
//!     .bootstrap(membership)
//!     .start(MemoryStore::new(), network.transport(1), Counter::default())
//!     .await?;
//! network.register(1, handle.mailbox());
//!
//! let committed = handle.propose(3).await?;
//! assert_eq!(committed.output, 3);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod log;
mod membership;
mod message;
mod node;
mod raft;
mod types;

pub mod http;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use error::{BoxError, ProposeError, StorageError, StorageErrorKind, TransportError};
pub use log::RaftLog;
pub use membership::{Member, Membership, MembershipChange, MembershipError};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, InstallSnapshotRequest,
    InstallSnapshotResponse, Message, VoteRequest, VoteResponse,
};
pub use node::{Committed, Mailbox, NodeStatus, RaftHandle, RaftNode, StateMachine};
pub use raft::{Raft, Ready};
pub use storage::{LocalStore, LogStore, MemoryStore, Recovered};
pub use transport::{MemoryNetwork, MemoryTransport, Transport};
pub use types::{Command, Entry, EntryPayload, HardState, LogIndex, NodeId, Role, Snapshot, Term};
