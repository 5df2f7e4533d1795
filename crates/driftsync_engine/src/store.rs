//! Local store abstraction.
//!
//! The engine only requires a durable keyed store with read/write/delete by
//! id and range queries by timestamp. The concrete engine (SQLite, sled,
//! platform storage) is chosen by whatever composes the core; `MemoryStore`
//! serves tests and in-process embedding.

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use driftsync_model::{PendingChange, SyncCursor, SyncStatus, SyncableRecord};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Durable storage consumed by the sync core.
///
/// Local reads and writes are assumed fast and never suspend a cycle, so the
/// trait is synchronous. Implementations must make each call atomic: no
/// partially-applied multi-row write, no lost update under concurrent
/// enqueue/dequeue of a single entry.
pub trait LocalStore: Send + Sync {
    /// Reads a record by identity.
    fn get_record(&self, entity_type: &str, id: Uuid) -> SyncResult<Option<SyncableRecord>>;

    /// Inserts or replaces a record.
    fn put_record(&self, record: &SyncableRecord) -> SyncResult<()>;

    /// Inserts or replaces several records in one transaction.
    fn put_records(&self, records: &[SyncableRecord]) -> SyncResult<()>;

    /// Physically removes a record (tombstone pruning, collapse of never-
    /// uploaded creates).
    fn remove_record(&self, entity_type: &str, id: Uuid) -> SyncResult<()>;

    /// Returns records modified after `since`, oldest first. `None` returns
    /// every record of the entity type.
    fn query_modified_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<SyncableRecord>>;

    /// Reads the live queue entry for an entity, if any.
    fn queue_get(&self, entity_type: &str, id: Uuid) -> SyncResult<Option<PendingChange>>;

    /// Inserts or replaces the queue entry keyed by `(entity_type, entity_id)`.
    fn queue_upsert(&self, change: &PendingChange) -> SyncResult<()>;

    /// Removes a queue entry.
    fn queue_remove(&self, entity_type: &str, id: Uuid) -> SyncResult<()>;

    /// Lists queue entries, optionally scoped to one entity type.
    fn queue_entries(&self, entity_type: Option<&str>) -> SyncResult<Vec<PendingChange>>;

    /// Reads the cursor row for an entity type.
    fn get_cursor(&self, entity_type: &str) -> SyncResult<Option<SyncCursor>>;

    /// Writes the cursor row for an entity type.
    fn set_cursor(&self, cursor: &SyncCursor) -> SyncResult<()>;

    /// Removes confirmed-deleted tombstones older than `older_than`.
    ///
    /// Returns the number of pruned records.
    fn prune_tombstones(&self, entity_type: &str, older_than: DateTime<Utc>) -> SyncResult<usize>;
}

#[derive(Default)]
struct MemoryStoreInner {
    records: BTreeMap<(String, Uuid), SyncableRecord>,
    queue: BTreeMap<(String, Uuid), PendingChange>,
    cursors: HashMap<String, SyncCursor>,
}

/// An in-memory store for tests and in-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records across entity types.
    pub fn record_count(&self) -> usize {
        self.inner.read().records.len()
    }
}

impl LocalStore for MemoryStore {
    fn get_record(&self, entity_type: &str, id: Uuid) -> SyncResult<Option<SyncableRecord>> {
        let inner = self.inner.read();
        Ok(inner.records.get(&(entity_type.to_string(), id)).cloned())
    }

    fn put_record(&self, record: &SyncableRecord) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.records.insert(
            (record.entity_type.clone(), record.local_id),
            record.clone(),
        );
        Ok(())
    }

    fn put_records(&self, records: &[SyncableRecord]) -> SyncResult<()> {
        let mut inner = self.inner.write();
        for record in records {
            inner.records.insert(
                (record.entity_type.clone(), record.local_id),
                record.clone(),
            );
        }
        Ok(())
    }

    fn remove_record(&self, entity_type: &str, id: Uuid) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.records.remove(&(entity_type.to_string(), id));
        Ok(())
    }

    fn query_modified_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<SyncableRecord>> {
        let inner = self.inner.read();
        let mut records: Vec<SyncableRecord> = inner
            .records
            .values()
            .filter(|r| r.entity_type == entity_type)
            .filter(|r| since.map_or(true, |ts| r.last_modified > ts))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.last_modified);
        Ok(records)
    }

    fn queue_get(&self, entity_type: &str, id: Uuid) -> SyncResult<Option<PendingChange>> {
        let inner = self.inner.read();
        Ok(inner.queue.get(&(entity_type.to_string(), id)).cloned())
    }

    fn queue_upsert(&self, change: &PendingChange) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.queue.insert(
            (change.entity_type.clone(), change.entity_id),
            change.clone(),
        );
        Ok(())
    }

    fn queue_remove(&self, entity_type: &str, id: Uuid) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner.queue.remove(&(entity_type.to_string(), id));
        Ok(())
    }

    fn queue_entries(&self, entity_type: Option<&str>) -> SyncResult<Vec<PendingChange>> {
        let inner = self.inner.read();
        Ok(inner
            .queue
            .values()
            .filter(|c| entity_type.map_or(true, |t| c.entity_type == t))
            .cloned()
            .collect())
    }

    fn get_cursor(&self, entity_type: &str) -> SyncResult<Option<SyncCursor>> {
        let inner = self.inner.read();
        Ok(inner.cursors.get(entity_type).cloned())
    }

    fn set_cursor(&self, cursor: &SyncCursor) -> SyncResult<()> {
        let mut inner = self.inner.write();
        inner
            .cursors
            .insert(cursor.entity_type.clone(), cursor.clone());
        Ok(())
    }

    fn prune_tombstones(&self, entity_type: &str, older_than: DateTime<Utc>) -> SyncResult<usize> {
        let mut inner = self.inner.write();
        let before = inner.records.len();
        inner.records.retain(|(t, _), record| {
            !(t == entity_type
                && record.is_deleted
                && record.sync_status == SyncStatus::Synced
                && record.last_modified < older_than)
        });
        Ok(before - inner.records.len())
    }
}

/// A store wrapper that fails every call, for error-path tests.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
use crate::error::SyncError;

#[cfg(test)]
impl LocalStore for FailingStore {
    fn get_record(&self, _: &str, _: Uuid) -> SyncResult<Option<SyncableRecord>> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn put_record(&self, _: &SyncableRecord) -> SyncResult<()> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn put_records(&self, _: &[SyncableRecord]) -> SyncResult<()> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn remove_record(&self, _: &str, _: Uuid) -> SyncResult<()> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn query_modified_since(
        &self,
        _: &str,
        _: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<SyncableRecord>> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn queue_get(&self, _: &str, _: Uuid) -> SyncResult<Option<PendingChange>> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn queue_upsert(&self, _: &PendingChange) -> SyncResult<()> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn queue_remove(&self, _: &str, _: Uuid) -> SyncResult<()> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn queue_entries(&self, _: Option<&str>) -> SyncResult<Vec<PendingChange>> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn get_cursor(&self, _: &str) -> SyncResult<Option<SyncCursor>> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn set_cursor(&self, _: &SyncCursor) -> SyncResult<()> {
        Err(SyncError::Store("disk unavailable".into()))
    }
    fn prune_tombstones(&self, _: &str, _: DateTime<Utc>) -> SyncResult<usize> {
        Err(SyncError::Store("disk unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(entity_type: &str) -> SyncableRecord {
        SyncableRecord::new(entity_type, json!({"title": "milk"})).unwrap()
    }

    #[test]
    fn record_roundtrip() {
        let store = MemoryStore::new();
        let rec = record("note");

        store.put_record(&rec).unwrap();
        let loaded = store.get_record("note", rec.local_id).unwrap().unwrap();
        assert_eq!(loaded, rec);

        store.remove_record("note", rec.local_id).unwrap();
        assert!(store.get_record("note", rec.local_id).unwrap().is_none());
    }

    #[test]
    fn query_modified_since_filters_and_orders() {
        let store = MemoryStore::new();

        let mut old = record("note");
        old.last_modified = Utc::now() - Duration::hours(2);
        let mut mid = record("note");
        mid.last_modified = Utc::now() - Duration::hours(1);
        let recent = record("note");
        let other_type = record("tag");

        store
            .put_records(&[recent.clone(), old.clone(), mid.clone(), other_type])
            .unwrap();

        let all = store.query_modified_since("note", None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].local_id, old.local_id);
        assert_eq!(all[2].local_id, recent.local_id);

        let since = store
            .query_modified_since("note", Some(Utc::now() - Duration::minutes(90)))
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[test]
    fn queue_is_keyed_by_entity() {
        let store = MemoryStore::new();
        let rec = record("note");
        let change = PendingChange::new(
            "note",
            rec.local_id,
            driftsync_model::ChangeAction::Create,
            Some(rec.payload.clone()),
            Uuid::new_v4(),
        );

        store.queue_upsert(&change).unwrap();
        assert!(store.queue_get("note", rec.local_id).unwrap().is_some());
        assert_eq!(store.queue_entries(Some("note")).unwrap().len(), 1);
        assert_eq!(store.queue_entries(Some("tag")).unwrap().len(), 0);

        store.queue_remove("note", rec.local_id).unwrap();
        assert!(store.queue_get("note", rec.local_id).unwrap().is_none());
    }

    #[test]
    fn cursor_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get_cursor("note").unwrap().is_none());

        let mut cursor = SyncCursor::new("note");
        cursor.advance(Utc::now());
        store.set_cursor(&cursor).unwrap();

        assert_eq!(store.get_cursor("note").unwrap(), Some(cursor));
    }

    #[test]
    fn prune_removes_only_confirmed_tombstones() {
        let store = MemoryStore::new();

        let mut pruned = record("note");
        pruned.server_id = Some("srv-1".into());
        pruned.is_deleted = true;
        pruned.sync_status = SyncStatus::Synced;
        pruned.last_modified = Utc::now() - Duration::days(60);

        let mut unconfirmed = record("note");
        unconfirmed.server_id = Some("srv-2".into());
        unconfirmed.is_deleted = true;
        unconfirmed.sync_status = SyncStatus::PendingDelete;
        unconfirmed.last_modified = Utc::now() - Duration::days(60);

        let live = record("note");

        store
            .put_records(&[pruned.clone(), unconfirmed.clone(), live.clone()])
            .unwrap();

        let removed = store
            .prune_tombstones("note", Utc::now() - Duration::days(30))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_record("note", pruned.local_id).unwrap().is_none());
        assert!(store
            .get_record("note", unconfirmed.local_id)
            .unwrap()
            .is_some());
        assert!(store.get_record("note", live.local_id).unwrap().is_some());
    }
}
