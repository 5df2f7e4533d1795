//! Remote service abstraction.
//!
//! The transport itself (HTTP framing, TLS, auth token refresh) lives
//! outside the core; implementations of `RemoteService` map their transport
//! failures onto the `SyncError` taxonomy, including per-call connection and
//! read timeouts surfacing as retriable errors.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftsync_model::{ChangeAction, PendingChange, SyncStatus, SyncableRecord};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

/// Per-item result of a batched push.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// The server accepted the item.
    Accepted {
        /// The server's copy, carrying the assigned `server_id`. Absent for
        /// deletes.
        server_record: Option<SyncableRecord>,
    },
    /// The server reported the item conflicted (409).
    Conflicted {
        /// The server's current copy, when the response carried one. Absent
        /// when the record no longer exists remotely.
        remote: Option<SyncableRecord>,
    },
    /// The server rejected the item permanently.
    Rejected {
        /// The rejection, classified fatal.
        error: SyncError,
    },
}

/// The remote authority the engine synchronizes against.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetches records modified after `since`, oldest first. `None` fetches
    /// everything (first sync).
    async fn fetch_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<SyncableRecord>>;

    /// Creates a record; the returned copy carries the assigned `server_id`.
    async fn create(&self, record: &SyncableRecord) -> SyncResult<SyncableRecord>;

    /// Updates an existing record.
    async fn update(&self, server_id: &str, record: &SyncableRecord)
        -> SyncResult<SyncableRecord>;

    /// Deletes a record. Idempotent: deleting an absent record succeeds.
    async fn delete(&self, server_id: &str) -> SyncResult<()>;

    /// Pushes a batch of pending changes, yielding one outcome per item in
    /// input order.
    ///
    /// The default implementation dispatches to the singular operations.
    /// Per-item conflicts and permanent rejections become outcomes; a
    /// retriable or cycle-aborting failure fails the whole batch so the
    /// retry policy can re-attempt it.
    async fn push_batch(&self, changes: &[PendingChange]) -> SyncResult<Vec<PushOutcome>> {
        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            let result = match (change.action, change.server_id.as_deref()) {
                (ChangeAction::Delete, Some(server_id)) => {
                    self.delete(server_id).await.map(|()| PushOutcome::Accepted {
                        server_record: None,
                    })
                }
                (ChangeAction::Update, Some(server_id)) => {
                    let record = change_as_record(change)?;
                    self.update(server_id, &record)
                        .await
                        .map(|server_record| PushOutcome::Accepted {
                            server_record: Some(server_record),
                        })
                }
                _ => {
                    let record = change_as_record(change)?;
                    self.create(&record)
                        .await
                        .map(|server_record| PushOutcome::Accepted {
                            server_record: Some(server_record),
                        })
                }
            };

            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) if error.is_conflict() => {
                    let remote = match &error {
                        SyncError::Conflict { descriptors } => descriptors
                            .iter()
                            .find(|d| d.entity_id == change.entity_id)
                            .and_then(|d| d.remote.clone()),
                        _ => None,
                    };
                    outcomes.push(PushOutcome::Conflicted { remote });
                }
                Err(error) if error.is_retriable() || error.aborts_cycle() => return Err(error),
                Err(error) => outcomes.push(PushOutcome::Rejected { error }),
            }
        }
        Ok(outcomes)
    }
}

/// Rebuilds the wire record from a queue entry's snapshot.
fn change_as_record(change: &PendingChange) -> SyncResult<SyncableRecord> {
    let payload = change
        .payload
        .clone()
        .ok_or_else(|| SyncError::Unknown("queued create/update carries no payload".into()))?;
    Ok(SyncableRecord {
        local_id: change.entity_id,
        server_id: change.server_id.clone(),
        entity_type: change.entity_type.clone(),
        payload,
        base_payload: None,
        last_modified: change.enqueued_at,
        is_deleted: change.action == ChangeAction::Delete,
        sync_status: SyncStatus::Syncing,
    })
}

#[derive(Default)]
struct MockRemoteInner {
    records: BTreeMap<String, SyncableRecord>,
    next_server_id: u64,
    fetch_errors: VecDeque<SyncError>,
    push_errors: VecDeque<SyncError>,
    conflicts: HashMap<Uuid, Option<SyncableRecord>>,
    rejects: HashMap<Uuid, SyncError>,
    fetch_calls: u64,
    push_calls: u64,
}

impl MockRemoteInner {
    fn assign_server_id(&mut self) -> String {
        self.next_server_id += 1;
        format!("srv-{}", self.next_server_id)
    }
}

/// A scriptable in-memory remote service for tests.
///
/// Behaves as a well-formed server by default: creates assign server ids,
/// deletes leave tombstones so other clients observe them through
/// `fetch_since`, and everything is ordered by modification time. Failures
/// and conflicts are injected per call or per record.
#[derive(Default)]
pub struct MockRemote {
    inner: Mutex<MockRemoteInner>,
    latency: Option<Duration>,
}

impl MockRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds artificial latency to every call, for concurrency tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Stores a record server-side, assigning a server id if absent.
    ///
    /// Returns the stored copy.
    pub fn seed_record(&self, mut record: SyncableRecord) -> SyncableRecord {
        let mut inner = self.inner.lock();
        let server_id = record
            .server_id
            .clone()
            .unwrap_or_else(|| inner.assign_server_id());
        record.server_id = Some(server_id.clone());
        record.sync_status = SyncStatus::Synced;
        inner.records.insert(server_id, record.clone());
        record
    }

    /// Fails the next `fetch_since` call with `error`.
    pub fn script_fetch_error(&self, error: SyncError) {
        self.inner.lock().fetch_errors.push_back(error);
    }

    /// Fails the next `push_batch` call with `error`.
    pub fn script_push_error(&self, error: SyncError) {
        self.inner.lock().push_errors.push_back(error);
    }

    /// Reports the given record as conflicted on its next push.
    pub fn script_conflict(&self, entity_id: Uuid, remote: Option<SyncableRecord>) {
        self.inner.lock().conflicts.insert(entity_id, remote);
    }

    /// Permanently rejects the given record on its next push.
    pub fn script_reject(&self, entity_id: Uuid, error: SyncError) {
        self.inner.lock().rejects.insert(entity_id, error);
    }

    /// All records currently held server-side, tombstones included.
    pub fn records(&self) -> Vec<SyncableRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    /// Number of live (non-tombstoned) records held server-side.
    pub fn live_record_count(&self) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| !r.is_deleted)
            .count()
    }

    /// Number of `push_batch` calls served.
    pub fn push_calls(&self) -> u64 {
        self.inner.lock().push_calls
    }

    /// Number of `fetch_since` calls served.
    pub fn fetch_calls(&self) -> u64 {
        self.inner.lock().fetch_calls
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn apply_change(inner: &mut MockRemoteInner, change: &PendingChange) -> PushOutcome {
        match change.action {
            ChangeAction::Create => {
                let server_id = inner.assign_server_id();
                let mut record = SyncableRecord {
                    local_id: change.entity_id,
                    server_id: Some(server_id.clone()),
                    entity_type: change.entity_type.clone(),
                    payload: change.payload.clone().unwrap_or_default(),
                    base_payload: None,
                    last_modified: Utc::now(),
                    is_deleted: false,
                    sync_status: SyncStatus::Synced,
                };
                record.base_payload = Some(record.payload.clone());
                inner.records.insert(server_id, record.clone());
                PushOutcome::Accepted {
                    server_record: Some(record),
                }
            }
            ChangeAction::Update => {
                let Some(server_id) = change.server_id.clone() else {
                    return PushOutcome::Rejected {
                        error: SyncError::Validation {
                            message: "update without server id".into(),
                            field_errors: Vec::new(),
                        },
                    };
                };
                match inner.records.get_mut(&server_id) {
                    Some(existing) if !existing.is_deleted => {
                        if let Some(payload) = change.payload.clone() {
                            existing.payload = payload;
                        }
                        existing.last_modified = Utc::now();
                        PushOutcome::Accepted {
                            server_record: Some(existing.clone()),
                        }
                    }
                    // Updated locally, deleted (or never known) remotely.
                    other => PushOutcome::Conflicted {
                        remote: other.cloned(),
                    },
                }
            }
            ChangeAction::Delete => {
                if let Some(server_id) = change.server_id.as_deref() {
                    if let Some(existing) = inner.records.get_mut(server_id) {
                        existing.is_deleted = true;
                        existing.last_modified = Utc::now();
                    }
                }
                PushOutcome::Accepted {
                    server_record: None,
                }
            }
        }
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn fetch_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<SyncableRecord>> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.fetch_calls += 1;
        if let Some(error) = inner.fetch_errors.pop_front() {
            return Err(error);
        }
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

    async fn create(&self, record: &SyncableRecord) -> SyncResult<SyncableRecord> {
        self.simulate_latency().await;
        let change = PendingChange::new(
            record.entity_type.clone(),
            record.local_id,
            ChangeAction::Create,
            Some(record.payload.clone()),
            Uuid::nil(),
        );
        let mut inner = self.inner.lock();
        match Self::apply_change(&mut inner, &change) {
            PushOutcome::Accepted {
                server_record: Some(record),
            } => Ok(record),
            PushOutcome::Rejected { error } => Err(error),
            _ => Err(SyncError::Unknown("create produced no record".into())),
        }
    }

    async fn update(
        &self,
        server_id: &str,
        record: &SyncableRecord,
    ) -> SyncResult<SyncableRecord> {
        self.simulate_latency().await;
        let change = PendingChange::new(
            record.entity_type.clone(),
            record.local_id,
            ChangeAction::Update,
            Some(record.payload.clone()),
            Uuid::nil(),
        )
        .with_server_id(server_id);
        let mut inner = self.inner.lock();
        match Self::apply_change(&mut inner, &change) {
            PushOutcome::Accepted {
                server_record: Some(record),
            } => Ok(record),
            PushOutcome::Conflicted { remote } => Err(SyncError::Conflict {
                descriptors: vec![crate::error::ConflictDescriptor {
                    entity_id: record.local_id,
                    remote,
                }],
            }),
            PushOutcome::Rejected { error } => Err(error),
            PushOutcome::Accepted { server_record: None } => {
                Err(SyncError::Unknown("update produced no record".into()))
            }
        }
    }

    async fn delete(&self, server_id: &str) -> SyncResult<()> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.records.get_mut(server_id) {
            existing.is_deleted = true;
            existing.last_modified = Utc::now();
        }
        Ok(())
    }

    async fn push_batch(&self, changes: &[PendingChange]) -> SyncResult<Vec<PushOutcome>> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.push_calls += 1;
        if let Some(error) = inner.push_errors.pop_front() {
            return Err(error);
        }

        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            if let Some(remote) = inner.conflicts.remove(&change.entity_id) {
                outcomes.push(PushOutcome::Conflicted { remote });
            } else if let Some(error) = inner.rejects.remove(&change.entity_id) {
                outcomes.push(PushOutcome::Rejected { error });
            } else {
                outcomes.push(Self::apply_change(&mut inner, change));
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(action: ChangeAction) -> PendingChange {
        PendingChange::new(
            "note",
            Uuid::new_v4(),
            action,
            Some(json!({"title": "milk"})),
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn create_assigns_server_id() {
        let remote = MockRemote::new();
        let outcomes = remote
            .push_batch(&[change(ChangeAction::Create)])
            .await
            .unwrap();

        match &outcomes[0] {
            PushOutcome::Accepted {
                server_record: Some(record),
            } => assert!(record.server_id.as_deref().unwrap().starts_with("srv-")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(remote.live_record_count(), 1);
    }

    #[tokio::test]
    async fn update_of_missing_record_is_a_conflict() {
        let remote = MockRemote::new();
        let outcomes = remote
            .push_batch(&[change(ChangeAction::Update).with_server_id("srv-404")])
            .await
            .unwrap();

        assert!(matches!(
            outcomes[0],
            PushOutcome::Conflicted { remote: None }
        ));
    }

    #[tokio::test]
    async fn delete_leaves_a_tombstone_visible_to_fetch() {
        let remote = MockRemote::new();
        let seeded = remote.seed_record(
            SyncableRecord::new("note", json!({"title": "milk"})).unwrap(),
        );

        let delete =
            change(ChangeAction::Delete).with_server_id(seeded.server_id.clone().unwrap());
        remote.push_batch(&[delete]).await.unwrap();

        assert_eq!(remote.live_record_count(), 0);
        let fetched = remote.fetch_since("note", None).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched[0].is_deleted);
    }

    #[tokio::test]
    async fn scripted_errors_are_consumed_in_order() {
        let remote = MockRemote::new();
        remote.script_fetch_error(SyncError::network("unreachable"));

        assert!(remote.fetch_since("note", None).await.is_err());
        assert!(remote.fetch_since("note", None).await.unwrap().is_empty());
    }

    /// A remote with only the singular operations, exercising the trait's
    /// default `push_batch`.
    struct SingularOnly(MockRemote);

    #[async_trait]
    impl RemoteService for SingularOnly {
        async fn fetch_since(
            &self,
            entity_type: &str,
            since: Option<DateTime<Utc>>,
        ) -> SyncResult<Vec<SyncableRecord>> {
            self.0.fetch_since(entity_type, since).await
        }

        async fn create(&self, record: &SyncableRecord) -> SyncResult<SyncableRecord> {
            self.0.create(record).await
        }

        async fn update(
            &self,
            server_id: &str,
            record: &SyncableRecord,
        ) -> SyncResult<SyncableRecord> {
            self.0.update(server_id, record).await
        }

        async fn delete(&self, server_id: &str) -> SyncResult<()> {
            self.0.delete(server_id).await
        }
    }

    #[tokio::test]
    async fn default_push_batch_dispatches_singular_operations() {
        let remote = SingularOnly(MockRemote::new());

        let outcomes = remote
            .push_batch(&[
                change(ChangeAction::Create),
                change(ChangeAction::Update).with_server_id("srv-404"),
            ])
            .await
            .unwrap();

        assert!(matches!(outcomes[0], PushOutcome::Accepted { .. }));
        // The singular update's conflict error becomes a per-item outcome.
        assert!(matches!(outcomes[1], PushOutcome::Conflicted { .. }));
        assert_eq!(remote.0.live_record_count(), 1);
    }

    #[tokio::test]
    async fn scripted_conflict_applies_once() {
        let remote = MockRemote::new();
        let item = change(ChangeAction::Create);
        remote.script_conflict(item.entity_id, None);

        let outcomes = remote.push_batch(std::slice::from_ref(&item)).await.unwrap();
        assert!(matches!(outcomes[0], PushOutcome::Conflicted { .. }));

        let outcomes = remote.push_batch(&[item]).await.unwrap();
        assert!(matches!(outcomes[0], PushOutcome::Accepted { .. }));
    }
}
