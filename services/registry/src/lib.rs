//! # Replicated Container Registry
//!
//! The metadata side of a container registry, replicated across a small
//! cluster with the [`consensus`] crate. Every node keeps a content index of
//! blobs and manifests with reference counts, and a tag index, and changes
//! them only by applying committed [`RegistryOperation`]s in log order.
//!
//! ## Features
//!
//! - Blob registration, manifest publication and tag updates through the log
//! - Manifest admission checks per media type before anything is proposed
//! - Reference counting, so blobs are only collected once nothing uses them
//! - A leader-only [`GarbageCollector`] that proposes deletions
//! - Stale or linearizable reads
//! - An axum [`router`] for peer traffic, reads and membership changes
//!
//! ## Example
//!
//! ```no_run
//! use consensus::{Member, Membership, MemoryNetwork, MemoryStore};
//! use registry::{Digest, ReadConsistency, RegistryBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let registry = RegistryBuilder::new(1)
//!     .bootstrap(Membership::new([Member::voter(1, "node-1")]))
//!     .start(MemoryStore::new(), network.transport(1))
//!     .await?;
//! network.register(1, registry.mailbox());
//!
//! let layer = Digest::sha256_of(b"layer");
//! registry.register_blob(layer.clone(), 5, None).await?;
//! let blob = registry.read_blob(&layer, ReadConsistency::Linearizable).await?;
//! assert_eq!(blob.reference_count, 0);
//!
//! // Serve peer traffic and the read endpoints with axum.
//! let app = registry::router(registry.clone());
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

mod api;
mod config;
mod digest;
mod error;
mod garbage;
mod machine;
mod manifest;
mod operation;
mod router;
mod state;

pub use api::{ReadConsistency, Registry, RegistryBuilder, RegistryRaft};
pub use config::{ConfigError, GcConfig, PeerConfig, RegistryConfig};
pub use digest::{Digest, DigestError, is_valid_repository, is_valid_tag};
pub use error::{ApplyError, RegistryError, RegistryResult};
pub use garbage::{CollectionReport, GarbageCollector};
pub use manifest::{
    ManifestDescription, MediaType, resolve as resolve_references, validate as validate_manifest,
};
pub use operation::{Outcome, RegistryOperation};
pub use router::router;
pub use state::{BlobRecord, ManifestRecord, RegistryState, TAG_HISTORY_LIMIT, TagPointer};
