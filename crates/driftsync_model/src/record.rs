//! Syncable records and their status lifecycle.

use crate::error::{ModelError, ModelResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-record synchronization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Local and remote copies agree.
    Synced,
    /// A local create or update has not reached the server yet.
    PendingUpload,
    /// A local delete has not reached the server yet.
    PendingDelete,
    /// The record is part of an in-flight upload batch.
    Syncing,
    /// Local and remote versions diverged; awaiting resolution.
    Conflict,
    /// Upload retries were exhausted or the server rejected the record.
    UploadFailed,
    /// Delete retries were exhausted or the server rejected the delete.
    DeleteFailed,
}

impl SyncStatus {
    /// Returns true if the record still has a local mutation to push.
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::PendingUpload | SyncStatus::PendingDelete)
    }

    /// Returns true if a prior push attempt ended in failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, SyncStatus::UploadFailed | SyncStatus::DeleteFailed)
    }

    /// Returns true if this status is valid for a record without a server id.
    ///
    /// A record the server has never accepted cannot be `Synced`, carry a
    /// pending delete, or sit in conflict with a remote version.
    pub fn valid_without_server_id(&self) -> bool {
        matches!(
            self,
            SyncStatus::PendingUpload | SyncStatus::Syncing | SyncStatus::UploadFailed
        )
    }
}

/// A domain entity eligible for synchronization.
///
/// Identity is two-layered: `local_id` is assigned at creation and never
/// reused; `server_id` is assigned once the remote service first accepts the
/// record. Deletion is a state (`is_deleted` tombstone), not a row removal,
/// until the tombstone itself is pruned after confirmed remote deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Stable local identity.
    pub local_id: Uuid,
    /// Remote identity, present once the server has accepted the record.
    pub server_id: Option<String>,
    /// Entity family this record belongs to.
    pub entity_type: String,
    /// Entity-specific fields as a JSON object.
    pub payload: Value,
    /// Payload as of the last confirmed sync, used for three-way diffs.
    pub base_payload: Option<Value>,
    /// Wall-clock timestamp of the last local or applied-remote edit.
    pub last_modified: DateTime<Utc>,
    /// Tombstone flag.
    pub is_deleted: bool,
    /// Current sync status.
    pub sync_status: SyncStatus,
}

impl SyncableRecord {
    /// Creates a new locally-authored record awaiting its first upload.
    pub fn new(entity_type: impl Into<String>, payload: Value) -> ModelResult<Self> {
        if !payload.is_object() {
            return Err(ModelError::PayloadNotObject);
        }
        Ok(Self {
            local_id: Uuid::new_v4(),
            server_id: None,
            entity_type: entity_type.into(),
            payload,
            base_payload: None,
            last_modified: Utc::now(),
            is_deleted: false,
            sync_status: SyncStatus::PendingUpload,
        })
    }

    /// Transitions the record to `status`, enforcing the server-id invariant.
    pub fn set_status(&mut self, status: SyncStatus) -> ModelResult<()> {
        if self.server_id.is_none() && !status.valid_without_server_id() {
            return Err(ModelError::StatusRequiresServerId { status });
        }
        self.sync_status = status;
        Ok(())
    }

    /// Marks the record as confirmed by the server.
    ///
    /// Adopts `server_id` if newly assigned and snapshots the payload as the
    /// new three-way-diff base.
    pub fn mark_synced(&mut self, server_id: Option<String>) -> ModelResult<()> {
        if let Some(id) = server_id {
            self.server_id = Some(id);
        }
        self.set_status(SyncStatus::Synced)?;
        self.base_payload = Some(self.payload.clone());
        Ok(())
    }

    /// Applies a local edit to the payload.
    pub fn apply_local_edit(&mut self, payload: Value) -> ModelResult<()> {
        if !payload.is_object() {
            return Err(ModelError::PayloadNotObject);
        }
        self.payload = payload;
        self.last_modified = Utc::now();
        self.set_status(SyncStatus::PendingUpload)
    }

    /// Marks the record as locally deleted.
    ///
    /// Requires a server identity; a record the server has never seen is
    /// simply removed instead of tombstoned.
    pub fn tombstone(&mut self) -> ModelResult<()> {
        self.is_deleted = true;
        self.last_modified = Utc::now();
        self.set_status(SyncStatus::PendingDelete)
    }

    /// Returns true if the record was modified after `since`.
    ///
    /// A record with no watermark to compare against counts as modified.
    pub fn modified_since(&self, since: Option<DateTime<Utc>>) -> bool {
        since.map_or(true, |ts| self.last_modified > ts)
    }

    /// Checks the server-id/status invariant.
    pub fn invariant_holds(&self) -> bool {
        self.server_id.is_some() || self.sync_status.valid_without_server_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> SyncableRecord {
        SyncableRecord::new("note", json!({"title": "milk"})).unwrap()
    }

    #[test]
    fn new_record_is_pending_upload() {
        let rec = record();
        assert_eq!(rec.sync_status, SyncStatus::PendingUpload);
        assert!(rec.server_id.is_none());
        assert!(!rec.is_deleted);
        assert!(rec.invariant_holds());
    }

    #[test]
    fn payload_must_be_object() {
        let err = SyncableRecord::new("note", json!([1, 2, 3])).unwrap_err();
        assert_eq!(err, ModelError::PayloadNotObject);
    }

    #[test]
    fn synced_requires_server_id() {
        let mut rec = record();
        let err = rec.set_status(SyncStatus::Synced).unwrap_err();
        assert!(matches!(err, ModelError::StatusRequiresServerId { .. }));
        assert!(rec.invariant_holds());

        rec.server_id = Some("srv-1".into());
        rec.set_status(SyncStatus::Synced).unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn mark_synced_adopts_server_id_and_base() {
        let mut rec = record();
        rec.mark_synced(Some("srv-9".into())).unwrap();

        assert_eq!(rec.server_id.as_deref(), Some("srv-9"));
        assert_eq!(rec.sync_status, SyncStatus::Synced);
        assert_eq!(rec.base_payload, Some(rec.payload.clone()));
    }

    #[test]
    fn local_edit_reopens_upload() {
        let mut rec = record();
        rec.mark_synced(Some("srv-1".into())).unwrap();

        rec.apply_local_edit(json!({"title": "eggs"})).unwrap();
        assert_eq!(rec.sync_status, SyncStatus::PendingUpload);
        // Base snapshot still reflects the last synced payload.
        assert_eq!(rec.base_payload, Some(json!({"title": "milk"})));
    }

    #[test]
    fn tombstone_requires_server_id() {
        let mut rec = record();
        assert!(rec.tombstone().is_err());

        rec.mark_synced(Some("srv-1".into())).unwrap();
        rec.tombstone().unwrap();
        assert!(rec.is_deleted);
        assert_eq!(rec.sync_status, SyncStatus::PendingDelete);
    }

    #[test]
    fn status_predicates() {
        assert!(SyncStatus::PendingUpload.is_pending());
        assert!(SyncStatus::PendingDelete.is_pending());
        assert!(!SyncStatus::Synced.is_pending());

        assert!(SyncStatus::UploadFailed.is_failed());
        assert!(SyncStatus::DeleteFailed.is_failed());
        assert!(!SyncStatus::Conflict.is_failed());
    }
}
