use std::error::Error as StdError;
use std::fmt;

use camino::Utf8PathBuf;
use tracing_error::SpanTrace;

use crate::membership::MembershipError;
use crate::types::NodeId;

/// Boxed error used at state machine and transport seams.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Why a proposal did not produce an applied entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposeError {
    /// This node is not the leader. Retry against the hinted leader.
    #[error("not the leader{}", leader_hint(.leader, .address))]
    NotLeader {
        /// Leader this node currently follows, if known.
        leader: Option<NodeId>,
        /// Address of that leader, if known.
        address: Option<String>,
    },

    /// No leader with a live majority is reachable.
    #[error("no quorum available")]
    NoQuorum,

    /// The entry was not applied in time. It may still commit later.
    #[error("proposal timed out; outcome unknown")]
    Timeout,

    /// The membership change was refused.
    #[error("membership change refused: {0}")]
    Membership(#[from] MembershipError),

    /// The node is shutting down.
    #[error("node is shutting down")]
    Shutdown,
}

fn leader_hint(leader: &Option<NodeId>, address: &Option<String>) -> String {
    match (leader, address) {
        (Some(id), Some(address)) => format!(" (leader is node {id} at {address})"),
        (Some(id), None) => format!(" (leader is node {id})"),
        _ => String::new(),
    }
}

impl ProposeError {
    /// Whether retrying the same proposal, possibly elsewhere, is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProposeError::NotLeader { .. } | ProposeError::NoQuorum | ProposeError::Timeout
        )
    }
}

/// Failure delivering a message to a peer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer is not reachable from here.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// The address of the peer is unknown.
    #[error("no address known for node {0}")]
    UnknownPeer(NodeId),

    /// The peer answered with an error status.
    #[error("node {node} rejected the message: {status}")]
    Rejected {
        /// Destination node.
        node: NodeId,
        /// Response status.
        status: http::StatusCode,
    },

    /// Encoding or sending the message failed.
    #[error("sending to node {node} failed: {source}")]
    Send {
        /// Destination node.
        node: NodeId,
        /// Underlying error.
        #[source]
        source: BoxError,
    },
}

/// Categorizes log store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Reading or writing the backing files failed.
    Io,

    /// A persisted record could not be decoded.
    Corrupt,

    /// A record could not be encoded.
    Serialization,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::Corrupt => write!(f, "corrupt record"),
            StorageErrorKind::Serialization => write!(f, "serialization error"),
        }
    }
}

/// Failure persisting or recovering consensus state.
///
/// Storage errors are fatal to a node: the driver stops rather than risk
/// acknowledging state it has not made durable.
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    path: Option<Utf8PathBuf>,
    context: &'static str,
    source: BoxError,
    span_trace: SpanTrace,
}

impl StorageError {
    /// Create a new storage error.
    pub fn new<E>(kind: StorageErrorKind, context: &'static str, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            kind,
            path: None,
            context,
            source: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }

    /// Returns a closure suitable for `map_err` which records the file involved.
    pub fn at<E>(
        kind: StorageErrorKind,
        context: &'static str,
        path: impl Into<Utf8PathBuf>,
    ) -> impl FnOnce(E) -> StorageError
    where
        E: Into<BoxError>,
    {
        let path = path.into();
        move |error| {
            let mut error = StorageError::new(kind, context, error);
            error.path = Some(path);
            error
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the file involved, if any.
    pub fn path(&self) -> Option<&camino::Utf8Path> {
        self.path.as_deref()
    }

    /// Returns the span trace captured where the error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log store {} ({})", self.kind, self.context)?;
        if let Some(path) = &self.path {
            write!(f, " at {path}")?;
        }
        write!(f, ": {}", self.source)
    }
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}
