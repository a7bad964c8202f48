use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and batching parameters for a consensus node.
///
/// Election and heartbeat intervals are counted in ticks, so the wall-clock
/// election timeout is `tick_ms * election_ticks`, randomized up to twice that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RaftConfig {
    /// Length of one logical clock tick in milliseconds.
    pub tick_ms: u64,

    /// Ticks without hearing from a leader before starting an election.
    pub election_ticks: u32,

    /// Ticks between leader heartbeats. Must be well below `election_ticks`.
    pub heartbeat_ticks: u32,

    /// Upper bound on entries shipped in a single append message.
    pub max_entries_per_message: usize,

    /// Applied entries between state machine snapshots.
    pub snapshot_threshold: u64,

    /// How long a proposal may wait for its entry to be applied.
    pub propose_timeout_ms: u64,

    /// Probe electability before bumping the term.
    pub pre_vote: bool,

    /// Leaders step down when they stop hearing from a majority.
    pub check_quorum: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            election_ticks: 10,
            heartbeat_ticks: 2,
            max_entries_per_message: 64,
            snapshot_threshold: 1024,
            propose_timeout_ms: 5000,
            pre_vote: true,
            check_quorum: true,
        }
    }
}

impl RaftConfig {
    /// Duration of one tick.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Maximum time to wait for a proposal to apply.
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    /// Base election timeout.
    pub fn election_timeout(&self) -> Duration {
        self.tick() * self.election_ticks
    }
}
