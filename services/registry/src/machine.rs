use std::sync::Arc;

use consensus::{BoxError, LogIndex, StateMachine};
use parking_lot::RwLock;

use crate::error::ApplyError;
use crate::operation::{Outcome, RegistryOperation};
use crate::state::RegistryState;

/// Feeds committed entries into the shared [`RegistryState`].
#[derive(Debug, Clone)]
pub(crate) struct RegistryMachine {
    state: Arc<RwLock<RegistryState>>,
}

impl RegistryMachine {
    pub(crate) fn new(state: Arc<RwLock<RegistryState>>) -> Self {
        Self { state }
    }
}

impl StateMachine for RegistryMachine {
    type Command = RegistryOperation;
    type Output = Result<Outcome, ApplyError>;

    fn apply(&mut self, index: LogIndex, operation: &RegistryOperation) -> Self::Output {
        let result = self.state.write().apply(index, operation);
        match &result {
            Ok(outcome) => tracing::trace!(index, op = operation.kind(), ?outcome, "applied"),
            Err(err @ ApplyError::CorruptionDetected { .. }) => {
                tracing::error!(index, op = operation.kind(), %err, "corruption detected");
            }
            Err(err) => tracing::warn!(index, op = operation.kind(), %err, "entry rejected"),
        }
        result
    }

    fn snapshot(&self) -> Result<Vec<u8>, BoxError> {
        Ok(self.state.read().to_bytes()?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), BoxError> {
        self.state.write().restore(data)?;
        Ok(())
    }
}
