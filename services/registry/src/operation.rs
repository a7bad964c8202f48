//! Mutations carried by the replicated log.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::manifest::MediaType;

/// One registry mutation. Operations only take effect once committed, and
/// then on every node in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RegistryOperation {
    /// Record that a blob's content is stored, optionally noting where.
    RegisterBlob {
        /// Content digest.
        digest: Digest,
        /// Content size in bytes.
        size: u64,
        /// Node or location holding the bytes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
    },

    /// Record a validated manifest, mount it in the repository it was
    /// pushed to and take a reference on everything it points at.
    PublishManifest {
        /// Repository the manifest was pushed to.
        repository: String,
        /// Digest of the manifest body.
        digest: Digest,
        /// Media type the manifest was validated as.
        media_type: MediaType,
        /// Size of the manifest body.
        size: u64,
        /// Digests referenced by the manifest.
        references: BTreeSet<Digest>,
    },

    /// Make known content visible in a repository.
    Mount {
        /// Repository name.
        repository: String,
        /// Content digest.
        digest: Digest,
    },

    /// Hide content from a repository, dropping the repository's tags on it.
    Unmount {
        /// Repository name.
        repository: String,
        /// Content digest.
        digest: Digest,
    },

    /// Point a tag at a manifest mounted in the tag's repository.
    UpdateTag {
        /// Repository name.
        repository: String,
        /// Tag name.
        tag: String,
        /// Manifest digest.
        digest: Digest,
    },

    /// Remove a tag.
    DeleteTag {
        /// Repository name.
        repository: String,
        /// Tag name.
        tag: String,
    },

    /// Remove an unreferenced blob from the content index.
    DeleteBlob {
        /// Content digest.
        digest: Digest,
    },
}

impl RegistryOperation {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryOperation::RegisterBlob { .. } => "register-blob",
            RegistryOperation::PublishManifest { .. } => "publish-manifest",
            RegistryOperation::Mount { .. } => "mount",
            RegistryOperation::Unmount { .. } => "unmount",
            RegistryOperation::UpdateTag { .. } => "update-tag",
            RegistryOperation::DeleteTag { .. } => "delete-tag",
            RegistryOperation::DeleteBlob { .. } => "delete-blob",
        }
    }
}

/// What applying an operation changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum Outcome {
    /// The entry was at or below the last applied index and was skipped.
    AlreadyApplied,

    /// A blob registration applied.
    BlobRegistered {
        /// False when the blob was already known.
        created: bool,
    },

    /// A manifest publication applied.
    ManifestPublished {
        /// False when the manifest was already known.
        created: bool,
    },

    /// Content was mounted in a repository.
    Mounted {
        /// False when it was already mounted there.
        created: bool,
    },

    /// Content was unmounted from a repository.
    Unmounted {
        /// False when it was not mounted there.
        existed: bool,
        /// Tags removed because they pointed at the content.
        untagged: Vec<String>,
    },

    /// A tag now points at a new digest.
    TagUpdated {
        /// Digest the tag pointed at before, if any.
        previous: Option<Digest>,
    },

    /// A tag was removed.
    TagDeleted {
        /// Digest the tag pointed at.
        previous: Digest,
    },

    /// A blob deletion applied.
    BlobDeleted {
        /// False when the blob was already gone.
        existed: bool,
        /// Digests whose references were released because the blob was a
        /// manifest.
        released: BTreeSet<Digest>,
    },
}
