//! Error taxonomy and classification for sync operations.

use driftsync_model::{ConflictType, ModelError, SyncableRecord};
use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A field-level message attached to a validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Name of the rejected field.
    pub field: String,
    /// Server-provided message.
    pub message: String,
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Identifies a record the server reported as conflicted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDescriptor {
    /// The conflicted record's local id.
    pub entity_id: Uuid,
    /// The server's copy, when the response carried one.
    pub remote: Option<SyncableRecord>,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Host unreachable, timed out, or the connection was reset.
    #[error("network error: {message}")]
    Network {
        /// Transport-level message.
        message: String,
    },

    /// A remote call exceeded its connection or read timeout.
    #[error("operation timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// Authentication or authorization failed (401/403).
    ///
    /// Never retried silently; surfaced so the caller can re-authenticate.
    #[error("authentication failed ({status}): {message}")]
    Auth {
        /// HTTP status code, 401 or 403.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// The server's response could not be decoded.
    #[error("malformed response: {0}")]
    Parse(String),

    /// The server rejected a record's content.
    #[error("validation failed: {message}")]
    Validation {
        /// Summary message.
        message: String,
        /// Per-field detail.
        field_errors: Vec<FieldError>,
    },

    /// The server reported one or more conflicts (409).
    ///
    /// Routed to the conflict resolver; a first-class outcome, not a failure.
    #[error("conflict reported for {} record(s)", descriptors.len())]
    Conflict {
        /// The conflicted records.
        descriptors: Vec<ConflictDescriptor>,
    },

    /// The local store failed.
    #[error("store error: {0}")]
    Store(String),

    /// A local mutation referenced a record that does not exist.
    #[error("no {entity_type} record with id {entity_id}")]
    RecordNotFound {
        /// Entity family.
        entity_type: String,
        /// The missing record's local id.
        entity_id: Uuid,
    },

    /// The cycle was cancelled between chunks or retry attempts.
    #[error("sync cancelled")]
    Cancelled,

    /// A state transition was requested that the state machine forbids.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A sync cycle is already running for the requested scope.
    #[error("a sync cycle is already active for {scope}")]
    CycleActive {
        /// Entity type, or "all" for a full sync.
        scope: String,
    },

    /// A merge was requested for a conflict that does not permit it.
    #[error("merge is not applicable to {conflict_type:?} conflicts")]
    MergeNotApplicable {
        /// The conflict type that rejected the merge.
        conflict_type: ConflictType,
    },

    /// Anything the taxonomy does not cover.
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Coarse classification consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retry with backoff.
    Retriable,
    /// Permanent; rethrow immediately.
    Fatal,
    /// Conflict-bearing; route to the resolver, never retry as a failure.
    Conflict,
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Maps an HTTP status to the matching taxonomy entry.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Auth {
                status,
                message: message.into(),
            },
            409 => Self::Conflict {
                descriptors: Vec::new(),
            },
            _ => Self::Server {
                status,
                message: message.into(),
            },
        }
    }

    /// Classifies the error for the retry policy.
    pub fn classify(&self) -> ErrorClass {
        match self {
            SyncError::Network { .. } | SyncError::Timeout => ErrorClass::Retriable,
            SyncError::Server { status, .. } => match status {
                500..=599 => ErrorClass::Retriable,
                409 => ErrorClass::Conflict,
                _ => ErrorClass::Fatal,
            },
            SyncError::Conflict { .. } => ErrorClass::Conflict,
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns true if the retry policy may re-attempt after this error.
    pub fn is_retriable(&self) -> bool {
        self.classify() == ErrorClass::Retriable
    }

    /// Returns true if this error carries conflict descriptors.
    pub fn is_conflict(&self) -> bool {
        self.classify() == ErrorClass::Conflict
    }

    /// Returns true if this error aborts the whole cycle rather than a
    /// single item.
    ///
    /// Auth and parse failures mean nothing further can succeed; store
    /// failures mean local writes can no longer be trusted; cancellation
    /// stops the cycle by definition.
    pub fn aborts_cycle(&self) -> bool {
        matches!(
            self,
            SyncError::Auth { .. }
                | SyncError::Parse(_)
                | SyncError::Store(_)
                | SyncError::Cancelled
                | SyncError::InvalidStateTransition { .. }
        )
    }
}

impl From<ModelError> for SyncError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::MergeNotApplicable { conflict_type } => {
                SyncError::MergeNotApplicable { conflict_type }
            }
            other => SyncError::Store(other.to_string()),
        }
    }
}
