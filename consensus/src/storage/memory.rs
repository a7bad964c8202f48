use std::sync::Arc;

use parking_lot::Mutex;

use super::{LogStore, Recovered};
use crate::error::StorageError;
use crate::types::{Command, Entry, HardState, LogIndex, Snapshot};

/// A log store held in memory.
///
/// Clones share the same contents, so a test can stop a node and start a
/// new one over the same store to simulate a crash and restart.
#[derive(Debug, Clone)]
pub struct MemoryStore<C> {
    inner: Arc<Mutex<Recovered<C>>>,
}

impl<C> Default for MemoryStore<C> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Recovered::default())),
        }
    }
}

impl<C: Clone> MemoryStore<C> {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> Recovered<C> {
        self.inner.lock().clone()
    }
}

#[async_trait::async_trait]
impl<C: Command> LogStore<C> for MemoryStore<C> {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&mut self) -> Result<Recovered<C>, StorageError> {
        Ok(self.contents())
    }

    async fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.inner.lock().hard_state = *state;
        Ok(())
    }

    async fn append(&mut self, entries: &[Entry<C>]) -> Result<(), StorageError> {
        self.inner.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    async fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.inner.lock().entries.retain(|e| e.index < index);
        Ok(())
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.index > snapshot.index);
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
