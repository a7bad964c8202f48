//! The content index and tag index.
//!
//! [`RegistryState`] only changes through [`RegistryState::apply`], one
//! committed entry at a time. Everything is kept in ordered maps so two
//! nodes that applied the same entries serialize to identical bytes.
//!
//! Content is associated with the repositories it was pushed or mounted
//! into. Tags can only point at manifests mounted in their repository.
//! Mounts are not references: unmounted content is still collected by
//! reference count alone.

use std::collections::{BTreeMap, BTreeSet};

use consensus::LogIndex;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::ApplyError;
use crate::manifest::MediaType;
use crate::operation::{Outcome, RegistryOperation};

/// How many earlier digests each tag remembers. Part of the replicated
/// behaviour, so it is fixed rather than configured per node.
pub const TAG_HISTORY_LIMIT: usize = 10;

/// A blob in the content index. Manifests are blobs too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlobRecord {
    /// Content digest.
    pub digest: Digest,
    /// Content size in bytes.
    pub size: u64,
    /// Manifests referencing this blob plus tags pointing at it.
    pub reference_count: u64,
    /// Where the bytes are held.
    pub locations: BTreeSet<String>,
    /// Repositories the content is mounted in.
    pub repositories: BTreeSet<String>,
}

/// A published manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestRecord {
    /// Digest of the manifest body.
    pub digest: Digest,
    /// Media type it was validated as.
    pub media_type: MediaType,
    /// Size of the body.
    pub size: u64,
    /// Config, layers and child manifests it references.
    pub references: BTreeSet<Digest>,
}

/// Where a tag points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TagPointer {
    /// Repository name.
    pub repository: String,
    /// Tag name.
    pub tag: String,
    /// Current manifest digest.
    pub digest: Digest,
    /// Earlier digests, most recent first. History does not hold
    /// references, so old digests may be collected.
    pub history: Vec<Digest>,
}

/// Replicated registry state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryState {
    last_applied: LogIndex,
    blobs: BTreeMap<Digest, BlobRecord>,
    manifests: BTreeMap<Digest, ManifestRecord>,
    tags: BTreeMap<String, BTreeMap<String, TagPointer>>,
}

fn acquire(blobs: &mut BTreeMap<Digest, BlobRecord>, digest: &Digest) {
    match blobs.get_mut(digest) {
        Some(record) => record.reference_count += 1,
        None => tracing::error!(%digest, "reference taken on a missing blob"),
    }
}

fn release(blobs: &mut BTreeMap<Digest, BlobRecord>, digest: &Digest) {
    match blobs.get_mut(digest) {
        Some(record) => match record.reference_count.checked_sub(1) {
            Some(count) => record.reference_count = count,
            None => tracing::error!(%digest, "reference count underflow"),
        },
        None => tracing::error!(%digest, "reference released on a missing blob"),
    }
}

impl RegistryState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry applied.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Look up a blob.
    pub fn blob(&self, digest: &Digest) -> Option<&BlobRecord> {
        self.blobs.get(digest)
    }

    /// Look up a manifest.
    pub fn manifest(&self, digest: &Digest) -> Option<&ManifestRecord> {
        self.manifests.get(digest)
    }

    /// Whether `digest` is known and mounted in `repository`.
    pub fn is_mounted(&self, repository: &str, digest: &Digest) -> bool {
        self.blobs
            .get(digest)
            .is_some_and(|record| record.repositories.contains(repository))
    }

    /// Look up a tag.
    pub fn tag(&self, repository: &str, tag: &str) -> Option<&TagPointer> {
        self.tags.get(repository)?.get(tag)
    }

    /// Tags of a repository, in name order.
    pub fn tags(&self, repository: &str) -> impl Iterator<Item = &TagPointer> {
        self.tags.get(repository).into_iter().flat_map(|tags| tags.values())
    }

    /// Repositories with at least one tag.
    pub fn repositories(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    /// Every blob in the content index.
    pub fn blobs(&self) -> impl Iterator<Item = &BlobRecord> {
        self.blobs.values()
    }

    /// Blobs nothing refers to, candidates for collection.
    pub fn unreferenced_blobs(&self) -> impl Iterator<Item = &BlobRecord> {
        self.blobs.values().filter(|b| b.reference_count == 0)
    }

    /// Count live references from manifests and tags, independently of the
    /// recorded counts.
    pub fn live_references(&self) -> BTreeMap<Digest, u64> {
        let mut counts: BTreeMap<Digest, u64> = self.blobs.keys().map(|d| (d.clone(), 0)).collect();
        let targets = self
            .manifests
            .values()
            .flat_map(|m| m.references.iter())
            .chain(self.tags.values().flat_map(|t| t.values()).map(|t| &t.digest));
        for digest in targets {
            *counts.entry(digest.clone()).or_default() += 1;
        }
        counts
    }

    /// Serialize for a snapshot.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Replace the contents with a snapshot.
    pub fn restore(&mut self, data: &[u8]) -> Result<(), serde_json::Error> {
        *self = serde_json::from_slice(data)?;
        Ok(())
    }

    /// Apply the committed entry at `index`. Entries at or below the last
    /// applied index are skipped, and a rejected entry leaves the indexes
    /// untouched.
    pub fn apply(&mut self, index: LogIndex, operation: &RegistryOperation) -> Result<Outcome, ApplyError> {
        if index <= self.last_applied {
            return Ok(Outcome::AlreadyApplied);
        }
        self.last_applied = index;

        match operation {
            RegistryOperation::RegisterBlob {
                digest,
                size,
                location,
            } => self.register_blob(digest, *size, location.as_deref()),
            RegistryOperation::PublishManifest {
                repository,
                digest,
                media_type,
                size,
                references,
            } => self.publish_manifest(repository, digest, *media_type, *size, references),
            RegistryOperation::Mount { repository, digest } => self.mount(repository, digest),
            RegistryOperation::Unmount { repository, digest } => self.unmount(repository, digest),
            RegistryOperation::UpdateTag {
                repository,
                tag,
                digest,
            } => self.update_tag(repository, tag, digest),
            RegistryOperation::DeleteTag { repository, tag } => self.delete_tag(repository, tag),
            RegistryOperation::DeleteBlob { digest } => self.delete_blob(digest),
        }
    }

    fn register_blob(&mut self, digest: &Digest, size: u64, location: Option<&str>) -> Result<Outcome, ApplyError> {
        match self.blobs.get_mut(digest) {
            Some(record) if record.size != size => Err(ApplyError::CorruptionDetected {
                digest: digest.clone(),
                recorded: record.size,
                proposed: size,
            }),
            Some(record) => {
                if let Some(location) = location {
                    record.locations.insert(location.to_owned());
                }
                Ok(Outcome::BlobRegistered { created: false })
            }
            None => {
                self.blobs.insert(
                    digest.clone(),
                    BlobRecord {
                        digest: digest.clone(),
                        size,
                        reference_count: 0,
                        locations: location.into_iter().map(str::to_owned).collect(),
                        repositories: BTreeSet::new(),
                    },
                );
                Ok(Outcome::BlobRegistered { created: true })
            }
        }
    }

    fn publish_manifest(
        &mut self,
        repository: &str,
        digest: &Digest,
        media_type: MediaType,
        size: u64,
        references: &BTreeSet<Digest>,
    ) -> Result<Outcome, ApplyError> {
        if references.contains(digest) {
            return Err(ApplyError::SelfReference {
                digest: digest.clone(),
            });
        }
        if let Some(missing) = references.iter().find(|d| !self.blobs.contains_key(*d)) {
            return Err(ApplyError::UnresolvedReference {
                digest: missing.clone(),
            });
        }
        if let Some(record) = self.blobs.get(digest) {
            if record.size != size {
                return Err(ApplyError::CorruptionDetected {
                    digest: digest.clone(),
                    recorded: record.size,
                    proposed: size,
                });
            }
        }
        if self.manifests.contains_key(digest) {
            if let Some(record) = self.blobs.get_mut(digest) {
                record.repositories.insert(repository.to_owned());
            }
            return Ok(Outcome::ManifestPublished { created: false });
        }

        self.blobs
            .entry(digest.clone())
            .or_insert_with(|| BlobRecord {
                digest: digest.clone(),
                size,
                reference_count: 0,
                locations: BTreeSet::new(),
                repositories: BTreeSet::new(),
            })
            .repositories
            .insert(repository.to_owned());
        for reference in references {
            acquire(&mut self.blobs, reference);
        }
        self.manifests.insert(
            digest.clone(),
            ManifestRecord {
                digest: digest.clone(),
                media_type,
                size,
                references: references.clone(),
            },
        );
        Ok(Outcome::ManifestPublished { created: true })
    }

    fn mount(&mut self, repository: &str, digest: &Digest) -> Result<Outcome, ApplyError> {
        let record = self.blobs.get_mut(digest).ok_or_else(|| ApplyError::BlobNotFound {
            digest: digest.clone(),
        })?;
        let created = record.repositories.insert(repository.to_owned());
        Ok(Outcome::Mounted { created })
    }

    /// Unmounting a manifest also removes the repository's tags on it.
    fn unmount(&mut self, repository: &str, digest: &Digest) -> Result<Outcome, ApplyError> {
        let existed = self
            .blobs
            .get_mut(digest)
            .is_some_and(|record| record.repositories.remove(repository));

        let mut untagged = Vec::new();
        if let Some(tags) = self.tags.get_mut(repository) {
            tags.retain(|tag, pointer| {
                let keep = pointer.digest != *digest;
                if !keep {
                    untagged.push(tag.clone());
                }
                keep
            });
            if tags.is_empty() {
                self.tags.remove(repository);
            }
        }
        for _ in &untagged {
            release(&mut self.blobs, digest);
        }
        Ok(Outcome::Unmounted { existed, untagged })
    }

    fn update_tag(&mut self, repository: &str, tag: &str, digest: &Digest) -> Result<Outcome, ApplyError> {
        if !self.manifests.contains_key(digest) {
            return Err(ApplyError::ManifestNotFound {
                digest: digest.clone(),
            });
        }
        if !self.is_mounted(repository, digest) {
            return Err(ApplyError::NotMounted {
                repository: repository.to_owned(),
                digest: digest.clone(),
            });
        }

        let tags = self.tags.entry(repository.to_owned()).or_default();
        let previous = match tags.get_mut(tag) {
            Some(pointer) if pointer.digest == *digest => return Ok(Outcome::TagUpdated { previous: Some(digest.clone()) }),
            Some(pointer) => {
                let previous = std::mem::replace(&mut pointer.digest, digest.clone());
                pointer.history.insert(0, previous.clone());
                pointer.history.truncate(TAG_HISTORY_LIMIT);
                Some(previous)
            }
            None => {
                tags.insert(
                    tag.to_owned(),
                    TagPointer {
                        repository: repository.to_owned(),
                        tag: tag.to_owned(),
                        digest: digest.clone(),
                        history: Vec::new(),
                    },
                );
                None
            }
        };

        acquire(&mut self.blobs, digest);
        if let Some(previous) = &previous {
            release(&mut self.blobs, previous);
        }
        Ok(Outcome::TagUpdated { previous })
    }

    fn delete_tag(&mut self, repository: &str, tag: &str) -> Result<Outcome, ApplyError> {
        let not_found = || ApplyError::TagNotFound {
            repository: repository.to_owned(),
            tag: tag.to_owned(),
        };
        let tags = self.tags.get_mut(repository).ok_or_else(not_found)?;
        let pointer = tags.remove(tag).ok_or_else(not_found)?;
        if tags.is_empty() {
            self.tags.remove(repository);
        }

        release(&mut self.blobs, &pointer.digest);
        Ok(Outcome::TagDeleted {
            previous: pointer.digest,
        })
    }

    fn delete_blob(&mut self, digest: &Digest) -> Result<Outcome, ApplyError> {
        let Some(record) = self.blobs.get(digest) else {
            return Ok(Outcome::BlobDeleted {
                existed: false,
                released: BTreeSet::new(),
            });
        };
        if record.reference_count > 0 {
            return Err(ApplyError::RefCountNonZero {
                digest: digest.clone(),
                count: record.reference_count,
            });
        }

        self.blobs.remove(digest);
        let released = match self.manifests.remove(digest) {
            Some(manifest) => {
                for reference in &manifest.references {
                    release(&mut self.blobs, reference);
                }
                manifest.references
            }
            None => BTreeSet::new(),
        };
        Ok(Outcome::BlobDeleted {
            existed: true,
            released,
        })
    }
}
