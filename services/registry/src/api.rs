//! Registry builder and the handle used by the HTTP front end.

use std::sync::Arc;

use consensus::{
    Committed, LogIndex, LogStore, Mailbox, Membership, MembershipChange, NodeId, NodeStatus,
    RaftConfig, RaftHandle, RaftNode, StorageError, Transport,
};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::config::RegistryConfig;
use crate::digest::{Digest, is_valid_repository, is_valid_tag};
use crate::error::{ApplyError, RegistryError, RegistryResult};
use crate::machine::RegistryMachine;
use crate::manifest::{self, ManifestDescription};
use crate::operation::{Outcome, RegistryOperation};
use crate::state::{BlobRecord, ManifestRecord, RegistryState, TagPointer};

/// How fresh a read must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadConsistency {
    /// Read whatever this node has applied. Works without a quorum.
    #[default]
    Stale,
    /// Commit a no-op first so the read observes every earlier write. Only
    /// succeeds on the leader.
    Linearizable,
}

/// Consensus handle specialised to registry operations.
pub type RegistryRaft = RaftHandle<RegistryOperation, Result<Outcome, ApplyError>>;

/// Registry builder for configuring and starting a registry node
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    node_id: NodeId,
    raft: RaftConfig,
    bootstrap: Membership,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            raft: RaftConfig::default(),
            bootstrap: Membership::default(),
        }
    }

    /// A builder with every setting taken from `config`.
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.node_id)
            .raft(config.raft.clone())
            .bootstrap(config.bootstrap())
    }

    /// Set the consensus parameters
    pub fn raft(mut self, config: RaftConfig) -> Self {
        self.raft = config;
        self
    }

    /// Set the founding voter set. Leave empty to join an existing cluster.
    pub fn bootstrap(mut self, membership: Membership) -> Self {
        self.bootstrap = membership;
        self
    }

    /// Recover from `store` and start the node.
    pub async fn start<L, T>(self, store: L, transport: T) -> Result<Registry, StorageError>
    where
        L: LogStore<RegistryOperation>,
        T: Transport<RegistryOperation>,
    {
        let state = Arc::new(RwLock::new(RegistryState::new()));
        let raft = RaftNode::new(self.node_id, self.raft)
            .bootstrap(self.bootstrap)
            .start(store, transport, RegistryMachine::new(Arc::clone(&state)))
            .await?;
        Ok(Registry { raft, state })
    }
}

/// A running registry node.
///
/// Writes go through consensus and return once applied locally. Reads come
/// from this node's applied state.
#[derive(Debug, Clone)]
pub struct Registry {
    raft: RegistryRaft,
    state: Arc<RwLock<RegistryState>>,
}

fn check_repository(repository: &str) -> RegistryResult<()> {
    if is_valid_repository(repository) {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(repository.to_owned()))
    }
}

fn check_tag(tag: &str) -> RegistryResult<()> {
    if is_valid_tag(tag) {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_owned()))
    }
}

impl Registry {
    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.raft.id()
    }

    /// The underlying consensus handle.
    pub fn raft(&self) -> &RegistryRaft {
        &self.raft
    }

    /// Inbound channel for peer messages.
    pub fn mailbox(&self) -> Mailbox<RegistryOperation> {
        self.raft.mailbox()
    }

    /// Current node status.
    pub fn status(&self) -> NodeStatus {
        self.raft.status()
    }

    /// Whether this node currently leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Replicate an operation and wait until it has applied here.
    #[tracing::instrument(level = "debug", skip(self, operation), fields(node = self.raft.id(), op = operation.kind()))]
    pub async fn propose(&self, operation: RegistryOperation) -> RegistryResult<Committed<Outcome>> {
        let committed = self.raft.propose(operation).await?;
        let output = committed.output?;
        Ok(Committed {
            index: committed.index,
            output,
        })
    }

    /// Record that a blob's bytes are stored.
    pub async fn register_blob(
        &self,
        digest: Digest,
        size: u64,
        location: Option<String>,
    ) -> RegistryResult<Committed<Outcome>> {
        self.propose(RegistryOperation::RegisterBlob {
            digest,
            size,
            location,
        })
        .await
    }

    /// Validate a manifest body, check its references and publish it into
    /// `repository`. Rejected manifests never reach the log.
    pub async fn publish_manifest(
        &self,
        repository: &str,
        media_type: &str,
        body: &[u8],
    ) -> RegistryResult<Committed<ManifestDescription>> {
        check_repository(repository)?;
        let description = manifest::validate(media_type, body)?;
        manifest::resolve(&description, &self.state.read())?;

        let committed = self
            .propose(RegistryOperation::PublishManifest {
                repository: repository.to_owned(),
                digest: description.digest.clone(),
                media_type: description.media_type,
                size: description.size,
                references: description.references.clone(),
            })
            .await?;
        Ok(Committed {
            index: committed.index,
            output: description,
        })
    }

    /// Make a known blob or manifest visible in `repository`.
    pub async fn mount_blob(&self, repository: &str, digest: Digest) -> RegistryResult<Committed<Outcome>> {
        check_repository(repository)?;
        if self.state.read().blob(&digest).is_none() {
            return Err(RegistryError::BlobNotFound(digest));
        }
        self.propose(RegistryOperation::Mount {
            repository: repository.to_owned(),
            digest,
        })
        .await
    }

    /// Hide content from `repository`. Tags in the repository pointing at
    /// it are removed in the same entry.
    pub async fn unmount_blob(&self, repository: &str, digest: Digest) -> RegistryResult<Committed<Outcome>> {
        check_repository(repository)?;
        self.propose(RegistryOperation::Unmount {
            repository: repository.to_owned(),
            digest,
        })
        .await
    }

    /// Point `repository:tag` at a manifest mounted in `repository`.
    pub async fn update_tag(
        &self,
        repository: &str,
        tag: &str,
        digest: Digest,
    ) -> RegistryResult<Committed<Outcome>> {
        check_repository(repository)?;
        check_tag(tag)?;
        {
            let state = self.state.read();
            if state.manifest(&digest).is_none() {
                return Err(RegistryError::ManifestNotFound(digest));
            }
            if !state.is_mounted(repository, &digest) {
                return Err(RegistryError::NotMounted {
                    repository: repository.to_owned(),
                    digest,
                });
            }
        }
        self.propose(RegistryOperation::UpdateTag {
            repository: repository.to_owned(),
            tag: tag.to_owned(),
            digest,
        })
        .await
    }

    /// Remove `repository:tag`.
    pub async fn delete_tag(&self, repository: &str, tag: &str) -> RegistryResult<Committed<Outcome>> {
        check_repository(repository)?;
        check_tag(tag)?;
        self.propose(RegistryOperation::DeleteTag {
            repository: repository.to_owned(),
            tag: tag.to_owned(),
        })
        .await
    }

    /// Remove an unreferenced blob.
    pub async fn delete_blob(&self, digest: Digest) -> RegistryResult<Committed<Outcome>> {
        self.propose(RegistryOperation::DeleteBlob { digest }).await
    }

    async fn read<T>(
        &self,
        consistency: ReadConsistency,
        read: impl FnOnce(&RegistryState) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        if consistency == ReadConsistency::Linearizable {
            self.raft.barrier().await?;
        }
        read(&self.state.read())
    }

    /// Look up a tag.
    pub async fn read_tag(
        &self,
        repository: &str,
        tag: &str,
        consistency: ReadConsistency,
    ) -> RegistryResult<TagPointer> {
        self.read(consistency, |state| {
            state
                .tag(repository, tag)
                .cloned()
                .ok_or_else(|| RegistryError::TagNotFound {
                    repository: repository.to_owned(),
                    tag: tag.to_owned(),
                })
        })
        .await
    }

    /// Look up a blob.
    pub async fn read_blob(&self, digest: &Digest, consistency: ReadConsistency) -> RegistryResult<BlobRecord> {
        self.read(consistency, |state| {
            state
                .blob(digest)
                .cloned()
                .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))
        })
        .await
    }

    /// Look up a blob as seen from `repository`. Content not mounted there
    /// is reported as unknown.
    pub async fn read_blob_in(
        &self,
        repository: &str,
        digest: &Digest,
        consistency: ReadConsistency,
    ) -> RegistryResult<BlobRecord> {
        check_repository(repository)?;
        self.read(consistency, |state| {
            state
                .blob(digest)
                .filter(|record| record.repositories.contains(repository))
                .cloned()
                .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))
        })
        .await
    }

    /// Look up a manifest as seen from `repository`.
    pub async fn read_manifest_in(
        &self,
        repository: &str,
        digest: &Digest,
        consistency: ReadConsistency,
    ) -> RegistryResult<ManifestRecord> {
        check_repository(repository)?;
        self.read(consistency, |state| {
            state
                .manifest(digest)
                .filter(|_| state.is_mounted(repository, digest))
                .cloned()
                .ok_or_else(|| RegistryError::ManifestNotFound(digest.clone()))
        })
        .await
    }

    /// Look up a manifest.
    pub async fn read_manifest(
        &self,
        digest: &Digest,
        consistency: ReadConsistency,
    ) -> RegistryResult<ManifestRecord> {
        self.read(consistency, |state| {
            state
                .manifest(digest)
                .cloned()
                .ok_or_else(|| RegistryError::ManifestNotFound(digest.clone()))
        })
        .await
    }

    /// Tag names of a repository, sorted.
    pub async fn list_tags(&self, repository: &str, consistency: ReadConsistency) -> RegistryResult<Vec<String>> {
        check_repository(repository)?;
        self.read(consistency, |state| {
            Ok(state.tags(repository).map(|t| t.tag.clone()).collect())
        })
        .await
    }

    /// Repositories with at least one tag, sorted.
    pub async fn repositories(&self, consistency: ReadConsistency) -> RegistryResult<Vec<String>> {
        self.read(consistency, |state| {
            Ok(state.repositories().map(str::to_owned).collect())
        })
        .await
    }

    /// Digests nobody references, from local state.
    pub(crate) fn unreferenced_blobs(&self) -> Vec<Digest> {
        self.state
            .read()
            .unreferenced_blobs()
            .map(|b| b.digest.clone())
            .collect()
    }

    /// Add or remove one member, returning the index the change committed at.
    pub async fn propose_membership_change(&self, change: MembershipChange) -> RegistryResult<LogIndex> {
        tracing::info!(node = self.raft.id(), ?change, "proposing membership change");
        Ok(self.raft.change_membership(change).await?)
    }

    /// Stop the node after persisting outstanding state.
    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consensus::{Member, MemoryNetwork, MemoryStore};

    async fn single_node() -> Registry {
        let network = MemoryNetwork::new();
        let registry = RegistryBuilder::new(1)
            .raft(RaftConfig {
                tick_ms: 10,
                ..RaftConfig::default()
            })
            .bootstrap(Membership::new([Member::voter(1, "node-1")]))
            .start(MemoryStore::new(), network.transport(1))
            .await
            .unwrap();
        network.register(1, registry.mailbox());
        for _ in 0..1000 {
            if registry.is_leader() {
                return registry;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("single node never became leader");
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_bad_names_without_proposing() {
        let registry = single_node().await;
        let before = registry.raft().status().last_log_index;
        let digest = Digest::sha256_of(b"m");

        assert!(matches!(
            registry.update_tag("Bad/Name", "v1", digest.clone()).await,
            Err(RegistryError::InvalidRepository(_))
        ));
        assert!(matches!(
            registry.update_tag("lib/app", ".v1", digest.clone()).await,
            Err(RegistryError::InvalidTag(_))
        ));
        assert_eq!(
            registry.update_tag("lib/app", "v1", digest.clone()).await,
            Err(RegistryError::ManifestNotFound(digest))
        );
        assert_eq!(registry.raft().status().last_log_index, before);
    }

    #[tokio::test(start_paused = true)]
    async fn linearizable_reads_see_earlier_writes() {
        let registry = single_node().await;
        let digest = Digest::sha256_of(b"layer");
        registry.register_blob(digest.clone(), 5, None).await.unwrap();

        let blob = registry
            .read_blob(&digest, ReadConsistency::Linearizable)
            .await
            .unwrap();
        assert_eq!(blob.size, 5);
        assert_eq!(
            registry.read_blob(&Digest::sha256_of(b"x"), ReadConsistency::Stale).await,
            Err(RegistryError::BlobNotFound(Digest::sha256_of(b"x")))
        );
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn content_is_scoped_to_mounted_repositories() {
        let registry = single_node().await;
        let layer = Digest::sha256_of(b"layer");
        registry.register_blob(layer.clone(), 5, None).await.unwrap();

        assert_eq!(
            registry.read_blob_in("lib/app", &layer, ReadConsistency::Stale).await,
            Err(RegistryError::BlobNotFound(layer.clone()))
        );
        registry.mount_blob("lib/app", layer.clone()).await.unwrap();
        assert_eq!(
            registry
                .read_blob_in("lib/app", &layer, ReadConsistency::Stale)
                .await
                .unwrap()
                .size,
            5
        );
        assert!(registry.read_blob_in("other/app", &layer, ReadConsistency::Stale).await.is_err());

        let before = registry.raft().status().last_log_index;
        assert_eq!(
            registry.mount_blob("lib/app", Digest::sha256_of(b"x")).await,
            Err(RegistryError::BlobNotFound(Digest::sha256_of(b"x")))
        );
        assert_eq!(registry.raft().status().last_log_index, before);

        registry.unmount_blob("lib/app", layer.clone()).await.unwrap();
        assert!(registry.read_blob_in("lib/app", &layer, ReadConsistency::Stale).await.is_err());
        registry.shutdown().await;
    }
}
