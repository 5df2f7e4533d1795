//! Durable queue of outstanding local mutations.

use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use driftsync_model::{ChangeAction, PendingChange};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// What `enqueue` did with the submitted change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No live entry existed; the change was inserted.
    Inserted,
    /// A live entry existed and was superseded by the newer change.
    Superseded,
    /// A delete cancelled out a never-uploaded create; nothing remains queued.
    Collapsed,
}

/// Durable queue of pending local mutations, keyed by `(entity_type,
/// entity_id)`.
///
/// The queue deduplicates at the identity level: re-enqueuing an entity
/// supersedes its prior entry (last edit wins). Content conflicts are
/// resolved later against the remote copy, not here. Durability is delegated
/// to the store, whose entry operations are atomic, so a crash between
/// enqueue and upload never loses a change.
pub struct PendingChangeQueue<S: LocalStore> {
    store: Arc<S>,
    attempt_ceiling: u32,
    /// Serializes read-modify-write sequences on entries, so concurrent
    /// enqueues of the same entity never lose an update.
    rmw: Mutex<()>,
}

impl<S: LocalStore> PendingChangeQueue<S> {
    /// Creates a queue over the given store.
    pub fn new(store: Arc<S>, attempt_ceiling: u32) -> Self {
        Self {
            store,
            attempt_ceiling,
            rmw: Mutex::new(()),
        }
    }

    /// Inserts or replaces the live entry for the change's entity.
    ///
    /// A `Create` superseded by a `Delete` before any successful upload
    /// collapses into a no-op: the remote service never saw the record, so
    /// nothing is uploaded and the entry is dropped.
    pub fn enqueue(&self, change: PendingChange) -> SyncResult<EnqueueOutcome> {
        let _rmw = self.rmw.lock();
        match self.store.queue_get(&change.entity_type, change.entity_id)? {
            Some(mut existing) => {
                if existing.action == ChangeAction::Create && change.action == ChangeAction::Delete
                {
                    self.store
                        .queue_remove(&change.entity_type, change.entity_id)?;
                    tracing::debug!(
                        entity_type = %change.entity_type,
                        entity_id = %change.entity_id,
                        "delete collapsed a never-uploaded create"
                    );
                    return Ok(EnqueueOutcome::Collapsed);
                }
                existing.supersede_with(change);
                self.store.queue_upsert(&existing)?;
                Ok(EnqueueOutcome::Superseded)
            }
            None => {
                self.store.queue_upsert(&change)?;
                Ok(EnqueueOutcome::Inserted)
            }
        }
    }

    /// Returns up to `limit` live entries without removing them.
    ///
    /// Entries are ordered by `priority` ascending, then `enqueued_at`
    /// ascending (FIFO within a priority). Dead-lettered entries are
    /// excluded until revived. Removal happens only on confirmed success.
    pub fn dequeue_batch(
        &self,
        limit: usize,
        entity_type: Option<&str>,
    ) -> SyncResult<Vec<PendingChange>> {
        let mut entries: Vec<PendingChange> = self
            .store
            .queue_entries(entity_type)?
            .into_iter()
            .filter(|entry| !entry.dead_letter)
            .collect();
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    /// Removes an entry after its upload was confirmed.
    pub fn mark_succeeded(&self, entity_type: &str, entity_id: Uuid) -> SyncResult<()> {
        self.store.queue_remove(entity_type, entity_id)
    }

    /// Records a failed attempt against an entry.
    ///
    /// Returns true if the entry crossed the attempt ceiling and was moved
    /// to the dead-letter state.
    pub fn mark_failed(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        error: &SyncError,
    ) -> SyncResult<bool> {
        let _rmw = self.rmw.lock();
        let Some(mut entry) = self.store.queue_get(entity_type, entity_id)? else {
            return Ok(false);
        };
        let dead_lettered = entry.record_failure(error.to_string(), self.attempt_ceiling);
        self.store.queue_upsert(&entry)?;
        if dead_lettered {
            tracing::warn!(
                entity_type,
                entity_id = %entity_id,
                attempts = entry.attempts,
                "queue entry dead-lettered"
            );
        }
        Ok(dead_lettered)
    }

    /// Returns a dead-lettered entry to normal retry flow.
    ///
    /// Returns true if an entry was revived.
    pub fn retry_dead_letter(&self, entity_type: &str, entity_id: Uuid) -> SyncResult<bool> {
        let _rmw = self.rmw.lock();
        let Some(mut entry) = self.store.queue_get(entity_type, entity_id)? else {
            return Ok(false);
        };
        if !entry.dead_letter {
            return Ok(false);
        }
        entry.reset_failures();
        self.store.queue_upsert(&entry)?;
        Ok(true)
    }

    /// Number of live (non-dead-letter) entries.
    pub fn pending_count(&self, entity_type: Option<&str>) -> SyncResult<usize> {
        Ok(self
            .store
            .queue_entries(entity_type)?
            .iter()
            .filter(|entry| !entry.dead_letter)
            .count())
    }
}
