//! Durable storage for the replicated log.

use std::fmt;

use crate::error::StorageError;
use crate::types::{Entry, HardState, LogIndex, Snapshot};

mod local;
mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Everything a node needs to resume after a restart.
#[derive(Debug, Clone)]
pub struct Recovered<C> {
    /// Last persisted term, vote and commit index.
    pub hard_state: HardState,
    /// Latest snapshot, if the log has been compacted.
    pub snapshot: Option<Snapshot>,
    /// Entries after the snapshot, in order.
    pub entries: Vec<Entry<C>>,
}

impl<C> Default for Recovered<C> {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            snapshot: None,
            entries: Vec::new(),
        }
    }
}

/// Durable backing for [`crate::RaftLog`] and [`HardState`].
///
/// Every method must only return once its effect is durable. The driver
/// calls them in the order they appear in a [`crate::Ready`]: hard state,
/// snapshot, truncation, then appends.
#[async_trait::async_trait]
pub trait LogStore<C>: fmt::Debug + Send + 'static {
    /// Name of the store, for logging.
    fn name(&self) -> &'static str;

    /// Read back the persisted state.
    async fn load(&mut self) -> Result<Recovered<C>, StorageError>;

    /// Persist term, vote and commit index.
    async fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError>;

    /// Append entries which directly follow the current last entry.
    async fn append(&mut self, entries: &[Entry<C>]) -> Result<(), StorageError>;

    /// Remove every entry at or after `index`.
    async fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError>;

    /// Persist a snapshot and drop the entries it covers.
    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}
