//! Node configuration, read from TOML.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use consensus::{Member, Membership, NodeId, RaftConfig};
use serde::Deserialize;

/// Failure loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}")]
    Read {
        /// File concerned.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration.
    #[error("parsing configuration")]
    Parse(#[from] toml_edit::de::Error),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A member of the founding voter set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PeerConfig {
    /// Node id.
    pub id: NodeId,
    /// Address the node serves peer traffic on.
    pub address: String,
}

/// Garbage collection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct GcConfig {
    /// Seconds between collection passes.
    pub interval_secs: u64,
    /// Seconds a blob must stay unreferenced before it is collected.
    pub grace_period_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_period_secs: 12 * 60 * 60,
        }
    }
}

impl GcConfig {
    /// Time between passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Minimum time a blob stays unreferenced before collection.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Configuration of one registry node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegistryConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// Address to serve HTTP on.
    pub listen: String,
    /// Directory for the log and snapshots.
    pub data_dir: Utf8PathBuf,
    /// The founding voter set. Leave empty to join an existing cluster.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Consensus settings.
    #[serde(default)]
    pub raft: RaftConfig,
    /// Garbage collection settings.
    #[serde(default)]
    pub gc: GcConfig,
}

impl RegistryConfig {
    /// Parse a TOML document.
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        let config: RegistryConfig = toml_edit::de::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&document)
    }

    /// Check consistency between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.node_id == 0 {
            return invalid("node-id must be positive".into());
        }
        if self.raft.heartbeat_ticks == 0 || self.raft.heartbeat_ticks >= self.raft.election_ticks {
            return invalid("raft.heartbeat-ticks must be positive and below raft.election-ticks".into());
        }
        let mut seen = std::collections::BTreeSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return invalid(format!("peer {} listed twice", peer.id));
            }
        }
        if !self.peers.is_empty() && !seen.contains(&self.node_id) {
            return invalid(format!(
                "peers must include this node ({}) or be empty to join a cluster",
                self.node_id
            ));
        }
        Ok(())
    }

    /// The founding configuration. Empty when joining an existing cluster.
    pub fn bootstrap(&self) -> Membership {
        Membership::new(
            self.peers
                .iter()
                .map(|peer| Member::voter(peer.id, peer.address.clone())),
        )
    }
}
