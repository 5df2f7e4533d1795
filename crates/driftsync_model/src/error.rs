//! Error types for the model crate.

use crate::conflict::ConflictType;
use crate::record::SyncStatus;
use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised by model-level invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A status was requested that requires a server identity the record lacks.
    #[error("status {status:?} requires a server id")]
    StatusRequiresServerId {
        /// The rejected status.
        status: SyncStatus,
    },

    /// A merge was requested for a conflict type that does not permit it.
    #[error("merge is not applicable to {conflict_type:?} conflicts")]
    MergeNotApplicable {
        /// The conflict type that rejected the merge.
        conflict_type: ConflictType,
    },

    /// A payload was not a JSON object.
    #[error("record payload must be a JSON object")]
    PayloadNotObject,
}
