//! Conflict detection and resolution.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use driftsync_model::{
    changed_fields, merge_payloads, ConflictRecord, ConflictType, ResolutionStrategy, SyncStatus,
    SyncableRecord,
};

/// What applying a resolution strategy decided.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The local version wins; re-enqueue it as a pending overwrite.
    KeepLocal {
        /// The local record, back in a pending status.
        record: SyncableRecord,
    },
    /// The remote version is adopted and the local pending change discarded.
    ///
    /// `None` means the remote copy was deleted and the local record adopts
    /// the deletion.
    KeepServer {
        /// The adopted remote record.
        record: Option<SyncableRecord>,
    },
    /// Disjoint change sets were merged into a new pending upload.
    Merged {
        /// The merged record.
        record: SyncableRecord,
    },
    /// The record stays in conflict, awaiting explicit external resolution.
    Manual,
}

/// Compares local and remote versions of a record, classifies divergence,
/// and applies resolution strategies.
///
/// Classification is a three-way diff against the payload snapshot taken at
/// the record's last confirmed sync (`base_payload`), which attributes each
/// differing field to the side that changed it.
#[derive(Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Creates a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Detects whether a local record and its remote counterpart diverged.
    ///
    /// Returns `None` when one side is strictly newer with no divergent
    /// fields since `last_synced`: the caller may safely overwrite in that
    /// direction.
    pub fn detect(
        &self,
        local: &SyncableRecord,
        remote: Option<&SyncableRecord>,
        last_synced: Option<DateTime<Utc>>,
    ) -> SyncResult<Option<ConflictRecord>> {
        let local_dirty = local.modified_since(last_synced);

        let remote = match remote {
            Some(r) if !r.is_deleted => r,
            // Remote side absent or tombstoned.
            gone => {
                if local.is_deleted || !local_dirty {
                    return Ok(None);
                }
                let fields = self.locally_changed_fields(local)?;
                return Ok(Some(ConflictRecord::new(
                    local.clone(),
                    gone.cloned(),
                    ConflictType::DeletedRemotely,
                    fields,
                )));
            }
        };
        let remote_dirty = remote.modified_since(last_synced);

        // Local side tombstoned while the remote copy moved on.
        if local.is_deleted {
            if !remote_dirty {
                return Ok(None);
            }
            let fields = changed_fields(&local.payload, &remote.payload)?;
            return Ok(Some(ConflictRecord::new(
                local.clone(),
                Some(remote.clone()),
                ConflictType::DeletedLocally,
                fields,
            )));
        }

        // Both alive: only simultaneous edits since the cursor can conflict.
        if !(local_dirty && remote_dirty) {
            return Ok(None);
        }
        let fields = changed_fields(&local.payload, &remote.payload)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let conflict_type = match &local.base_payload {
            Some(base) => {
                let local_changed = changed_fields(base, &local.payload)?;
                let remote_changed = changed_fields(base, &remote.payload)?;
                let overlap = fields
                    .iter()
                    .any(|f| local_changed.contains(f) && remote_changed.contains(f));
                if overlap {
                    ConflictType::ModifiedBoth
                } else {
                    ConflictType::DataConflict
                }
            }
            // No base to attribute field ownership; require a decision.
            None => ConflictType::ModifiedBoth,
        };

        Ok(Some(ConflictRecord::new(
            local.clone(),
            Some(remote.clone()),
            conflict_type,
            fields,
        )))
    }

    /// Classifies a conflict the server reported during upload.
    ///
    /// Falls back to `VersionConflict` when local diffing cannot explain the
    /// server's verdict.
    pub fn classify_push_conflict(
        &self,
        local: &SyncableRecord,
        remote: Option<&SyncableRecord>,
        last_synced: Option<DateTime<Utc>>,
    ) -> SyncResult<ConflictRecord> {
        if let Some(conflict) = self.detect(local, remote, last_synced)? {
            return Ok(conflict);
        }
        let fields = match remote {
            Some(r) if !r.is_deleted => changed_fields(&local.payload, &r.payload)?,
            _ => Vec::new(),
        };
        Ok(ConflictRecord::new(
            local.clone(),
            remote.cloned(),
            ConflictType::VersionConflict,
            fields,
        ))
    }

    /// Applies a resolution strategy to a detected conflict.
    ///
    /// `Merge` is only valid for `DataConflict` (disjoint field sets);
    /// requesting it for anything else fails with a policy error and the
    /// caller must fall back to another strategy.
    pub fn resolve(
        &self,
        conflict: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> SyncResult<Resolution> {
        match strategy {
            ResolutionStrategy::Manual => Ok(Resolution::Manual),
            ResolutionStrategy::KeepLocal => {
                let mut record = conflict.local_version.clone();
                let status = if record.is_deleted {
                    SyncStatus::PendingDelete
                } else {
                    SyncStatus::PendingUpload
                };
                record.set_status(status)?;
                Ok(Resolution::KeepLocal { record })
            }
            ResolutionStrategy::KeepServer => match &conflict.server_version {
                Some(remote) if !remote.is_deleted => {
                    let mut record = remote.clone();
                    record.local_id = conflict.local_version.local_id;
                    record.mark_synced(None)?;
                    Ok(Resolution::KeepServer {
                        record: Some(record),
                    })
                }
                _ => Ok(Resolution::KeepServer { record: None }),
            },
            ResolutionStrategy::Merge => {
                if !conflict.conflict_type.auto_mergeable() {
                    return Err(SyncError::MergeNotApplicable {
                        conflict_type: conflict.conflict_type,
                    });
                }
                let local = &conflict.local_version;
                let Some(remote) = &conflict.server_version else {
                    return Err(SyncError::MergeNotApplicable {
                        conflict_type: conflict.conflict_type,
                    });
                };
                let local_changed = self.locally_changed_fields(local)?;
                let merged = merge_payloads(&local.payload, &remote.payload, &local_changed)?;

                let mut record = local.clone();
                record.server_id = remote.server_id.clone();
                record.payload = merged;
                record.last_modified = Utc::now();
                record.set_status(SyncStatus::PendingUpload)?;
                Ok(Resolution::Merged { record })
            }
        }
    }

    /// Fields the local side changed since its last confirmed sync.
    ///
    /// Without a base snapshot every payload field counts as changed.
    fn locally_changed_fields(&self, local: &SyncableRecord) -> SyncResult<Vec<String>> {
        match &local.base_payload {
            Some(base) => Ok(changed_fields(base, &local.payload)?),
            None => {
                let mut fields: Vec<String> = local
                    .payload
                    .as_object()
                    .map(|map| map.keys().cloned().collect())
                    .unwrap_or_default();
                fields.sort();
                Ok(fields)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn synced_pair() -> (SyncableRecord, SyncableRecord, DateTime<Utc>) {
        let mut local = SyncableRecord::new("note", json!({"title": "milk", "done": false}))
            .unwrap();
        local.mark_synced(Some("srv-1".into())).unwrap();
        local.last_modified = Utc::now() - Duration::hours(1);

        let remote = local.clone();
        let last_synced = Utc::now() - Duration::minutes(30);
        (local, remote, last_synced)
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new()
    }

    #[test]
    fn no_conflict_when_only_remote_changed() {
        let (local, mut remote, last_synced) = synced_pair();
        remote.payload = json!({"title": "eggs", "done": false});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap();
        assert!(conflict.is_none());
    }

    #[test]
    fn no_conflict_when_only_local_changed() {
        let (mut local, remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap();
        assert!(conflict.is_none());
    }

    #[test]
    fn same_field_divergence_is_modified_both() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.payload = json!({"title": "bread", "done": false});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::ModifiedBoth);
        assert_eq!(conflict.conflict_fields, vec!["title"]);
    }

    #[test]
    fn disjoint_field_divergence_is_data_conflict() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.payload = json!({"title": "milk", "done": true});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DataConflict);
        assert_eq!(conflict.conflict_fields, vec!["done", "title"]);
    }

    #[test]
    fn remote_tombstone_against_local_edit_is_deleted_remotely() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.is_deleted = true;
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DeletedRemotely);

        // Absent remote counts the same as a tombstoned one.
        let conflict = resolver()
            .detect(&local, None, Some(last_synced))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DeletedRemotely);
    }

    #[test]
    fn local_tombstone_against_remote_edit_is_deleted_locally() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.tombstone().unwrap();
        remote.payload = json!({"title": "bread", "done": false});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DeletedLocally);
    }

    #[test]
    fn clean_remote_deletion_is_not_a_conflict() {
        let (local, mut remote, last_synced) = synced_pair();
        remote.is_deleted = true;
        remote.last_modified = Utc::now();

        // Local side untouched since the cursor: deletion simply applies.
        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap();
        assert!(conflict.is_none());
    }

    #[test]
    fn unexplainable_push_conflict_falls_back_to_version_conflict() {
        let (local, remote, last_synced) = synced_pair();

        let conflict = resolver()
            .classify_push_conflict(&local, Some(&remote), Some(last_synced))
            .unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::VersionConflict);
    }

    #[test]
    fn merge_fails_on_modified_both() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.payload = json!({"title": "bread", "done": false});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        let err = resolver()
            .resolve(&conflict, ResolutionStrategy::Merge)
            .unwrap_err();
        assert!(matches!(err, SyncError::MergeNotApplicable { .. }));
    }

    #[test]
    fn merge_combines_disjoint_changes() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.payload = json!({"title": "milk", "done": true});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        let resolution = resolver()
            .resolve(&conflict, ResolutionStrategy::Merge)
            .unwrap();

        match resolution {
            Resolution::Merged { record } => {
                // Local value for the locally-changed field, remote for the rest.
                assert_eq!(record.payload, json!({"title": "eggs", "done": true}));
                assert_eq!(record.sync_status, SyncStatus::PendingUpload);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn keep_local_restores_a_pending_status() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.payload = json!({"title": "bread", "done": false});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        match resolver()
            .resolve(&conflict, ResolutionStrategy::KeepLocal)
            .unwrap()
        {
            Resolution::KeepLocal { record } => {
                assert_eq!(record.sync_status, SyncStatus::PendingUpload);
                assert_eq!(record.payload, json!({"title": "eggs", "done": false}));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn keep_server_adopts_the_remote_copy() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.payload = json!({"title": "bread", "done": false});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        match resolver()
            .resolve(&conflict, ResolutionStrategy::KeepServer)
            .unwrap()
        {
            Resolution::KeepServer {
                record: Some(record),
            } => {
                assert_eq!(record.sync_status, SyncStatus::Synced);
                assert_eq!(record.payload, json!({"title": "bread", "done": false}));
                assert_eq!(record.local_id, local.local_id);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn keep_server_adopts_a_remote_deletion() {
        let (mut local, _, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();

        let conflict = resolver()
            .detect(&local, None, Some(last_synced))
            .unwrap()
            .unwrap();
        match resolver()
            .resolve(&conflict, ResolutionStrategy::KeepServer)
            .unwrap()
        {
            Resolution::KeepServer { record: None } => {}
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn manual_leaves_the_conflict_standing() {
        let (mut local, mut remote, last_synced) = synced_pair();
        local.apply_local_edit(json!({"title": "eggs", "done": false})).unwrap();
        remote.payload = json!({"title": "bread", "done": false});
        remote.last_modified = Utc::now();

        let conflict = resolver()
            .detect(&local, Some(&remote), Some(last_synced))
            .unwrap()
            .unwrap();
        assert!(matches!(
            resolver().resolve(&conflict, ResolutionStrategy::Manual).unwrap(),
            Resolution::Manual
        ));
    }
}
