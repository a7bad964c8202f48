//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use consensus::{MembershipError, NodeId, ProposeError};
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, DigestError};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Why a committed operation left the state unchanged.
///
/// Every node applies the same entries in the same order, so every node
/// reaches the same rejection for the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "error", rename_all = "kebab-case")]
pub enum ApplyError {
    /// A digest was registered again with a different size.
    #[error("corruption detected for {digest}: recorded size {recorded}, proposed size {proposed}")]
    CorruptionDetected {
        /// Digest concerned.
        digest: Digest,
        /// Size already in the content index.
        recorded: u64,
        /// Size carried by the rejected entry.
        proposed: u64,
    },

    /// A manifest references content missing from the content index.
    #[error("unresolved reference to {digest}")]
    UnresolvedReference {
        /// First missing digest.
        digest: Digest,
    },

    /// A manifest references itself.
    #[error("manifest {digest} references itself")]
    SelfReference {
        /// The manifest.
        digest: Digest,
    },

    /// A tag was pointed at something that is not a manifest.
    #[error("manifest not found: {digest}")]
    ManifestNotFound {
        /// Digest concerned.
        digest: Digest,
    },

    /// Content to mount is not in the content index.
    #[error("blob not found: {digest}")]
    BlobNotFound {
        /// Digest concerned.
        digest: Digest,
    },

    /// A tag was pointed at a manifest not mounted in its repository.
    #[error("{digest} is not mounted in {repository}")]
    NotMounted {
        /// Repository name.
        repository: String,
        /// Manifest digest.
        digest: Digest,
    },

    /// The tag to delete does not exist.
    #[error("tag not found: {repository}:{tag}")]
    TagNotFound {
        /// Repository name.
        repository: String,
        /// Tag name.
        tag: String,
    },

    /// A blob was still referenced when its deletion applied.
    #[error("{digest} still has {count} references")]
    RefCountNonZero {
        /// Digest concerned.
        digest: Digest,
        /// References at apply time.
        count: u64,
    },
}

/// Error types for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// This node is not the leader.
    #[error("not the leader")]
    NotLeader {
        /// Current leader, if known.
        leader: Option<NodeId>,
        /// Address of the current leader, if known.
        address: Option<String>,
    },

    /// A majority of the cluster is unreachable.
    #[error("no quorum available")]
    NoQuorum,

    /// The operation was not applied in time; it may still commit.
    #[error("operation timed out; outcome unknown")]
    Timeout,

    /// The node is shutting down.
    #[error("registry is unavailable")]
    Unavailable,

    /// The manifest does not match the schema for its media type.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A manifest references a digest missing from the content index.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(Digest),

    /// A blob is still referenced.
    #[error("{digest} still has {count} references")]
    RefCountNonZero {
        /// Digest concerned.
        digest: Digest,
        /// Number of live references.
        count: u64,
    },

    /// A digest was registered with two different sizes.
    #[error("corruption detected for {digest}: recorded size {recorded}, proposed size {proposed}")]
    CorruptionDetected {
        /// Digest concerned.
        digest: Digest,
        /// Size already recorded.
        recorded: u64,
        /// Conflicting size.
        proposed: u64,
    },

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(Digest),

    /// The content exists but is not mounted in the repository.
    #[error("{digest} is not mounted in {repository}")]
    NotMounted {
        /// Repository name.
        repository: String,
        /// Content digest.
        digest: Digest,
    },

    /// Tag not found
    #[error("tag not found: {repository}:{tag}")]
    TagNotFound {
        /// Repository name.
        repository: String,
        /// Tag name.
        tag: String,
    },

    /// Invalid digest format
    #[error(transparent)]
    InvalidDigest(#[from] DigestError),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// The membership change was refused.
    #[error(transparent)]
    Membership(#[from] MembershipError),
}

impl From<ProposeError> for RegistryError {
    fn from(err: ProposeError) -> Self {
        match err {
            ProposeError::NotLeader { leader, address } => RegistryError::NotLeader { leader, address },
            ProposeError::NoQuorum => RegistryError::NoQuorum,
            ProposeError::Timeout => RegistryError::Timeout,
            ProposeError::Membership(err) => RegistryError::Membership(err),
            ProposeError::Shutdown => RegistryError::Unavailable,
        }
    }
}

impl From<ApplyError> for RegistryError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::CorruptionDetected {
                digest,
                recorded,
                proposed,
            } => RegistryError::CorruptionDetected {
                digest,
                recorded,
                proposed,
            },
            ApplyError::UnresolvedReference { digest } => RegistryError::UnresolvedReference(digest),
            ApplyError::SelfReference { digest } => {
                RegistryError::SchemaViolation(format!("manifest {digest} references itself"))
            }
            ApplyError::ManifestNotFound { digest } => RegistryError::ManifestNotFound(digest),
            ApplyError::BlobNotFound { digest } => RegistryError::BlobNotFound(digest),
            ApplyError::NotMounted { repository, digest } => RegistryError::NotMounted { repository, digest },
            ApplyError::TagNotFound { repository, tag } => RegistryError::TagNotFound { repository, tag },
            ApplyError::RefCountNonZero { digest, count } => RegistryError::RefCountNonZero { digest, count },
        }
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::NotMounted { .. }
            | RegistryError::TagNotFound { .. } => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::SchemaViolation(_)
            | RegistryError::UnresolvedReference(_) => StatusCode::BAD_REQUEST,
            RegistryError::RefCountNonZero { .. }
            | RegistryError::CorruptionDetected { .. }
            | RegistryError::Membership(_) => StatusCode::CONFLICT,
            RegistryError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            RegistryError::NoQuorum | RegistryError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::TagNotFound { .. } => "MANIFEST_UNKNOWN",
            RegistryError::NotMounted { .. } => "MANIFEST_UNKNOWN",
            RegistryError::InvalidDigest(_) => "DIGEST_INVALID",
            RegistryError::SchemaViolation(_) => "MANIFEST_INVALID",
            RegistryError::UnresolvedReference(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::RefCountNonZero { .. } => "DENIED",
            RegistryError::CorruptionDetected { .. } => "DIGEST_INVALID",
            RegistryError::Membership(_) => "DENIED",
            RegistryError::NotLeader { .. } => "NOT_LEADER",
            RegistryError::NoQuorum | RegistryError::Unavailable | RegistryError::Timeout => {
                "UNAVAILABLE"
            }
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();
        let detail = match &self {
            RegistryError::NotLeader { leader, address } => {
                Some(serde_json::json!({ "leader": leader, "address": address }))
            }
            _ => None,
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code,
                message,
                detail,
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_consensus_outcomes() {
        let err = RegistryError::from(ProposeError::NotLeader {
            leader: Some(2),
            address: Some("10.0.0.2:5000".into()),
        });
        assert_eq!(err.status_code(), StatusCode::MISDIRECTED_REQUEST);
        assert_eq!(RegistryError::from(ProposeError::NoQuorum), RegistryError::NoQuorum);
        assert_eq!(
            RegistryError::from(ProposeError::Timeout).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn maps_apply_rejections() {
        let digest = Digest::sha256_of(b"layer");
        let err = RegistryError::from(ApplyError::RefCountNonZero {
            digest: digest.clone(),
            count: 2,
        });
        assert_eq!(err, RegistryError::RefCountNonZero { digest, count: 2 });
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn unmounted_content_is_unknown() {
        let digest = Digest::sha256_of(b"manifest");
        let err = RegistryError::from(ApplyError::NotMounted {
            repository: "other/app".into(),
            digest: digest.clone(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "MANIFEST_UNKNOWN");
        assert_eq!(
            RegistryError::from(ApplyError::BlobNotFound { digest: digest.clone() }),
            RegistryError::BlobNotFound(digest)
        );
    }
}
