//! Conflict classification and resolution strategies.

use crate::record::SyncableRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a local/remote divergence is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Both sides changed the same field with different values.
    ModifiedBoth,
    /// The local copy is tombstoned while the remote copy was modified.
    DeletedLocally,
    /// The remote copy is absent or tombstoned while the local copy was modified.
    DeletedRemotely,
    /// Both sides changed non-overlapping fields.
    DataConflict,
    /// The server reported a conflict that field diffing cannot explain.
    VersionConflict,
    /// Timestamps diverged without an identifiable field difference.
    TimestampConflict,
}

impl ConflictType {
    /// Returns true if a field-level merge is a valid resolution.
    pub fn auto_mergeable(&self) -> bool {
        matches!(self, ConflictType::DataConflict)
    }

    /// Returns true if one side of the conflict is a deletion.
    pub fn involves_deletion(&self) -> bool {
        matches!(
            self,
            ConflictType::DeletedLocally | ConflictType::DeletedRemotely
        )
    }
}

/// Strategy applied to resolve a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// The local version overwrites the remote one.
    KeepLocal,
    /// The remote version is adopted and the local pending change discarded.
    KeepServer,
    /// Field-level merge; valid only for disjoint change sets.
    Merge,
    /// Leave the record in conflict for explicit external resolution.
    Manual,
}

impl ResolutionStrategy {
    /// Returns true if the strategy resolves conflicts without intervention.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ResolutionStrategy::Manual)
    }
}

/// A detected divergence between a local record and its remote counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Local snapshot at detection time.
    pub local_version: SyncableRecord,
    /// Remote snapshot; absent when the remote copy no longer exists.
    pub server_version: Option<SyncableRecord>,
    /// Classification of the divergence.
    pub conflict_type: ConflictType,
    /// Fields whose values differ, in stable order.
    pub conflict_fields: Vec<String>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    /// Creates a conflict record stamped with the current time.
    pub fn new(
        local_version: SyncableRecord,
        server_version: Option<SyncableRecord>,
        conflict_type: ConflictType,
        conflict_fields: Vec<String>,
    ) -> Self {
        Self {
            local_version,
            server_version,
            conflict_type,
            conflict_fields,
            detected_at: Utc::now(),
        }
    }

    /// The conflicted record's local id.
    pub fn entity_id(&self) -> Uuid {
        self.local_version.local_id
    }

    /// The conflicted record's entity family.
    pub fn entity_type(&self) -> &str {
        &self.local_version.entity_type
    }
}
