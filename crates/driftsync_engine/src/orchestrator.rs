//! Sync orchestrator state machine.

use crate::batch::{BatchProcessor, ChunkOperation};
use crate::cancel::CancelFlag;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::PendingChangeQueue;
use crate::remote::{PushOutcome, RemoteService};
use crate::resolver::{ConflictResolver, Resolution};
use crate::retry::RetryPolicy;
use crate::store::LocalStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftsync_model::{
    ChangeAction, ConflictRecord, ConflictType, PendingChange, ResolutionStrategy, SyncCursor,
    SyncStatus, SyncableRecord,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// The current state of a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle is running.
    Idle,
    /// A cycle was admitted and is starting.
    Syncing,
    /// Draining the pending queue to the server.
    Uploading,
    /// Applying remote deltas since the cursor.
    Downloading,
    /// Applying the default strategy to detected conflicts.
    ResolvingConflicts,
    /// The cycle finished without fatal error.
    Completed,
    /// The cycle aborted; `clear_error` is required before the next start.
    Error,
}

impl SyncState {
    /// Returns true if a cycle is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Syncing
                | SyncState::Uploading
                | SyncState::Downloading
                | SyncState::ResolvingConflicts
        )
    }

    /// Returns true if a new cycle may start from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Completed)
    }
}

/// Phase a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Upload phase.
    Upload,
    /// Download phase.
    Download,
    /// Conflict resolution phase.
    Resolve,
}

/// Counts of items processed per phase, for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncProgress {
    /// Active phase; `None` outside a cycle.
    pub phase: Option<SyncPhase>,
    /// Items processed so far in the phase.
    pub processed: usize,
    /// Total items the phase will process.
    pub total: usize,
}

/// Cumulative counters across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that reached `Completed`.
    pub cycles_completed: u64,
    /// Records confirmed by the server across upload phases.
    pub records_uploaded: u64,
    /// Remote records applied locally across download phases.
    pub records_downloaded: u64,
    /// Conflicts detected.
    pub conflicts_detected: u64,
    /// Conflicts the default strategy resolved.
    pub conflicts_auto_resolved: u64,
    /// Transient-failure retries performed.
    pub retries: u64,
    /// Message of the most recent fatal error, if any.
    pub last_error: Option<String>,
    /// When the last cycle completed.
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A per-item failure reported in a cycle's result.
#[derive(Debug, Clone)]
pub struct FailedChange {
    /// Entity family.
    pub entity_type: String,
    /// The failing record's local id.
    pub entity_id: Uuid,
    /// The classified error.
    pub error: SyncError,
}

/// Result of one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Entity types the cycle covered.
    pub entity_types: Vec<String>,
    /// Records the server accepted.
    pub uploaded: usize,
    /// Remote records applied locally.
    pub downloaded: usize,
    /// Conflicts the default strategy resolved.
    pub auto_resolved: Vec<ConflictRecord>,
    /// Conflicts left standing for explicit resolution.
    pub unresolved: Vec<ConflictRecord>,
    /// Per-item failures; the cycle itself still completed.
    pub failed: Vec<FailedChange>,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

impl SyncReport {
    fn new(entity_types: Vec<String>) -> Self {
        Self {
            entity_types,
            uploaded: 0,
            downloaded: 0,
            auto_resolved: Vec::new(),
            unresolved: Vec::new(),
            failed: Vec::new(),
            duration: Duration::ZERO,
        }
    }
}

/// Adapts the remote service's batched push to the batch processor.
struct PushOp<'a, R: RemoteService> {
    remote: &'a R,
}

#[async_trait]
impl<R: RemoteService> ChunkOperation<PendingChange> for PushOp<'_, R> {
    async fn run(&self, _chunk_index: usize, chunk: &[PendingChange]) -> SyncResult<Vec<PushOutcome>> {
        self.remote.push_batch(chunk).await
    }
}

/// Releases claimed entity types when a cycle ends, however it ends.
struct ClaimGuard<'a> {
    active: &'a Mutex<BTreeSet<String>>,
    types: Vec<String>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        for t in &self.types {
            active.remove(t);
        }
    }
}

/// Coordinates full sync cycles against a local store and a remote service.
///
/// One cycle per entity type may be active at a time; independent entity
/// types own disjoint cursors and queue keys and may sync concurrently.
/// Upload and download phases within a cycle run sequentially. Observers
/// follow the `SyncState` and `SyncProgress` watch streams.
pub struct SyncOrchestrator<S: LocalStore, R: RemoteService> {
    config: SyncConfig,
    store: Arc<S>,
    remote: Arc<R>,
    queue: PendingChangeQueue<S>,
    batch: BatchProcessor,
    retry: RetryPolicy,
    resolver: ConflictResolver,
    cancel_flag: CancelFlag,
    state_tx: watch::Sender<SyncState>,
    progress_tx: watch::Sender<SyncProgress>,
    stats: RwLock<SyncStats>,
    retries: Arc<AtomicU64>,
    last_error: RwLock<Option<SyncError>>,
    active: Mutex<BTreeSet<String>>,
}

impl<S: LocalStore, R: RemoteService> SyncOrchestrator<S, R> {
    /// Creates an orchestrator over an explicitly constructed store handle
    /// and remote service; lifecycle is owned by whatever composes the core.
    pub fn new(config: SyncConfig, store: Arc<S>, remote: Arc<R>) -> Self {
        let retries = Arc::new(AtomicU64::new(0));
        let retry = RetryPolicy::with_counter(config.retry.clone(), Arc::clone(&retries));
        let batch = BatchProcessor::new(config.effective_batch_size(), retry.clone());
        let queue = PendingChangeQueue::new(Arc::clone(&store), config.attempt_ceiling);
        let (state_tx, _) = watch::channel(SyncState::Idle);
        let (progress_tx, _) = watch::channel(SyncProgress::default());

        Self {
            config,
            store,
            remote,
            queue,
            batch,
            retry,
            resolver: ConflictResolver::new(),
            cancel_flag: CancelFlag::new(),
            state_tx,
            progress_tx,
            stats: RwLock::new(SyncStats::default()),
            retries,
            last_error: RwLock::new(None),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// The current state.
    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    /// A watch stream of state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// A watch stream of per-phase progress counts.
    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// A snapshot of cumulative counters.
    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats.read().clone();
        stats.retries = self.retries.load(Ordering::Relaxed);
        stats
    }

    /// The error that put the orchestrator into `Error`, if any.
    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.read().clone()
    }

    /// Resets an `Error` state back to `Idle` without retrying.
    ///
    /// Returns false if the orchestrator was not in `Error`.
    pub fn clear_error(&self) -> bool {
        if self.state() != SyncState::Error {
            return false;
        }
        *self.last_error.write() = None;
        self.set_state(SyncState::Idle);
        true
    }

    /// Requests cancellation of the in-flight cycle.
    ///
    /// Honored between chunks and retry attempts; completed chunks keep
    /// their effects.
    pub fn cancel(&self) {
        self.cancel_flag.cancel();
    }

    /// The pending-change queue, for direct inspection.
    pub fn queue(&self) -> &PendingChangeQueue<S> {
        &self.queue
    }

    /// The local store handle.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The remote service handle.
    pub fn remote_service(&self) -> &Arc<R> {
        &self.remote
    }

    // ---- local mutation entry points -------------------------------------

    /// Tracks a locally-created record and queues its upload.
    pub fn create_record(&self, entity_type: &str, payload: Value) -> SyncResult<SyncableRecord> {
        let record = SyncableRecord::new(entity_type, payload)?;
        self.store.put_record(&record)?;
        let change = PendingChange::new(
            entity_type,
            record.local_id,
            ChangeAction::Create,
            Some(record.payload.clone()),
            self.config.device_id,
        );
        self.queue.enqueue(change)?;
        Ok(record)
    }

    /// Tracks a local edit and queues its upload.
    pub fn update_record(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        payload: Value,
    ) -> SyncResult<SyncableRecord> {
        let mut record = self.require_record(entity_type, entity_id)?;
        if record.is_deleted {
            return Err(SyncError::RecordNotFound {
                entity_type: entity_type.into(),
                entity_id,
            });
        }
        record.apply_local_edit(payload)?;
        self.store.put_record(&record)?;

        let action = if record.server_id.is_some() {
            ChangeAction::Update
        } else {
            ChangeAction::Create
        };
        let mut change = PendingChange::new(
            entity_type,
            entity_id,
            action,
            Some(record.payload.clone()),
            self.config.device_id,
        );
        change.server_id = record.server_id.clone();
        self.queue.enqueue(change)?;
        Ok(record)
    }

    /// Tracks a local deletion.
    ///
    /// A record the server has never seen is removed outright and its queued
    /// create collapses; anything else is tombstoned and a delete queued.
    pub fn delete_record(&self, entity_type: &str, entity_id: Uuid) -> SyncResult<()> {
        let mut record = self.require_record(entity_type, entity_id)?;

        if record.server_id.is_none() {
            let change = PendingChange::new(
                entity_type,
                entity_id,
                ChangeAction::Delete,
                None,
                self.config.device_id,
            );
            self.queue.enqueue(change)?;
            self.store.remove_record(entity_type, entity_id)?;
            return Ok(());
        }

        record.tombstone()?;
        self.store.put_record(&record)?;
        let mut change = PendingChange::new(
            entity_type,
            entity_id,
            ChangeAction::Delete,
            None,
            self.config.device_id,
        );
        change.server_id = record.server_id.clone();
        self.queue.enqueue(change)?;
        Ok(())
    }

    /// Revives a dead-lettered entry and returns its record to a pending
    /// status. Returns false if there was nothing to revive.
    pub fn retry_failed(&self, entity_type: &str, entity_id: Uuid) -> SyncResult<bool> {
        if !self.queue.retry_dead_letter(entity_type, entity_id)? {
            return Ok(false);
        }
        if let Some(mut record) = self.store.get_record(entity_type, entity_id)? {
            let status = if record.is_deleted {
                SyncStatus::PendingDelete
            } else {
                SyncStatus::PendingUpload
            };
            record.set_status(status)?;
            self.store.put_record(&record)?;
        }
        Ok(true)
    }

    /// Applies a strategy to a conflict left unresolved by a cycle.
    ///
    /// Returns false if the strategy was `Manual` (the record stays in
    /// conflict).
    pub fn resolve_conflict(
        &self,
        conflict: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> SyncResult<bool> {
        let resolution = self.resolver.resolve(conflict, strategy)?;
        self.apply_resolution(conflict, resolution)
    }

    /// Prunes confirmed-deleted tombstones past the retention window.
    pub fn prune_tombstones(&self) -> SyncResult<usize> {
        let retention = chrono::Duration::from_std(self.config.tombstone_retention)
            .map_err(|e| SyncError::Unknown(e.to_string()))?;
        let older_than = Utc::now() - retention;

        let mut pruned = 0;
        for entity_type in &self.config.entity_types {
            pruned += self.store.prune_tombstones(entity_type, older_than)?;
        }
        Ok(pruned)
    }

    // ---- sync cycles ------------------------------------------------------

    /// Runs a full cycle over every configured entity type.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let mut types = self.config.entity_types.clone();
        if types.is_empty() {
            let mut set = BTreeSet::new();
            for entry in self.store.queue_entries(None)? {
                set.insert(entry.entity_type);
            }
            types = set.into_iter().collect();
        }
        self.run_cycle(types, "all").await
    }

    /// Runs a cycle scoped to one entity type and its own cursor.
    pub async fn sync_entity_type(&self, entity_type: &str) -> SyncResult<SyncReport> {
        self.run_cycle(vec![entity_type.to_string()], entity_type)
            .await
    }

    async fn run_cycle(&self, types: Vec<String>, scope: &str) -> SyncResult<SyncReport> {
        let started = std::time::Instant::now();

        if self.state() == SyncState::Error {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", SyncState::Error),
                to: format!("{:?}", SyncState::Syncing),
            });
        }
        let _claim = self.claim(&types, scope)?;

        self.set_state(SyncState::Syncing);
        tracing::debug!(scope, "sync cycle started");
        let mut report = SyncReport::new(types.clone());

        match self.run_phases(&types, &mut report).await {
            Ok(()) => {
                report.duration = started.elapsed();
                self.finish_success(&report);
                Ok(report)
            }
            Err(error) => {
                self.finish_error(&error);
                Err(error)
            }
        }
    }

    async fn run_phases(&self, types: &[String], report: &mut SyncReport) -> SyncResult<()> {
        let mut conflicts: Vec<ConflictRecord> = Vec::new();

        self.set_state(SyncState::Uploading);
        for entity_type in types {
            self.upload_entity(entity_type, report, &mut conflicts)
                .await?;
        }

        self.set_state(SyncState::Downloading);
        let mut watermarks: Vec<(String, Option<DateTime<Utc>>)> = Vec::new();
        for entity_type in types {
            let max_ts = self
                .download_entity(entity_type, report, &mut conflicts)
                .await?;
            watermarks.push((entity_type.clone(), max_ts));
        }

        self.set_state(SyncState::ResolvingConflicts);
        self.resolve_detected(conflicts, report)?;

        // No fatal error reached this point: advance cursors.
        for (entity_type, max_ts) in watermarks {
            let mut cursor = self
                .store
                .get_cursor(&entity_type)?
                .unwrap_or_else(|| SyncCursor::new(&entity_type));
            if let Some(ts) = max_ts {
                cursor.advance(ts);
            }
            cursor.mark_success();
            self.store.set_cursor(&cursor)?;
        }

        Ok(())
    }

    async fn upload_entity(
        &self,
        entity_type: &str,
        report: &mut SyncReport,
        conflicts: &mut Vec<ConflictRecord>,
    ) -> SyncResult<()> {
        let total = self.queue.pending_count(Some(entity_type))?;
        let mut processed = 0;
        self.send_progress(SyncPhase::Upload, 0, total);

        // Entries already handled this cycle (conflicted or failed ones stay
        // queued) must not be re-dequeued within the same cycle.
        let mut seen: BTreeSet<Uuid> = BTreeSet::new();

        loop {
            self.check_cancelled()?;

            let batch: Vec<PendingChange> = self
                .queue
                .dequeue_batch(self.config.effective_batch_size(), Some(entity_type))?
                .into_iter()
                .filter(|change| !seen.contains(&change.entity_id))
                .collect();
            if batch.is_empty() {
                break;
            }
            seen.extend(batch.iter().map(|change| change.entity_id));

            for change in &batch {
                if let Some(mut record) = self.store.get_record(entity_type, change.entity_id)? {
                    record.set_status(SyncStatus::Syncing)?;
                    self.store.put_record(&record)?;
                }
            }

            let op = PushOp {
                remote: self.remote.as_ref(),
            };
            let outcome = self.batch.process(&batch, &self.cancel_flag, &op).await;

            for (change, server_record) in outcome.successful {
                self.apply_push_success(entity_type, &change, server_record)?;
                report.uploaded += 1;
                processed += 1;
            }
            for (change, remote) in outcome.conflicts {
                self.apply_push_conflict(entity_type, &change, remote, conflicts)?;
                processed += 1;
            }
            for (change, error) in outcome.failed {
                self.apply_push_failure(entity_type, &change, error, report)?;
                processed += 1;
            }
            self.send_progress(SyncPhase::Upload, processed, total);

            // Effects of completed chunks are applied above before a
            // cycle-level abort propagates.
            if let Some(error) = outcome.aborted {
                return Err(error);
            }
        }
        Ok(())
    }

    fn apply_push_success(
        &self,
        entity_type: &str,
        change: &PendingChange,
        server_record: Option<SyncableRecord>,
    ) -> SyncResult<()> {
        self.queue.mark_succeeded(entity_type, change.entity_id)?;

        if let Some(mut record) = self.store.get_record(entity_type, change.entity_id)? {
            let server_id = server_record.and_then(|r| r.server_id);
            record.mark_synced(server_id)?;
            self.store.put_record(&record)?;
        }
        Ok(())
    }

    fn apply_push_conflict(
        &self,
        entity_type: &str,
        change: &PendingChange,
        remote: Option<SyncableRecord>,
        conflicts: &mut Vec<ConflictRecord>,
    ) -> SyncResult<()> {
        let Some(mut record) = self.store.get_record(entity_type, change.entity_id)? else {
            return Ok(());
        };
        let cursor_ts = self
            .store
            .get_cursor(entity_type)?
            .and_then(|c| c.last_sync_timestamp);
        let conflict =
            self.resolver
                .classify_push_conflict(&record, remote.as_ref(), cursor_ts)?;

        // A create that already exists remotely adopts the server identity.
        if record.server_id.is_none() {
            record.server_id = remote.as_ref().and_then(|r| r.server_id.clone());
        }
        if record.server_id.is_some() {
            record.set_status(SyncStatus::Conflict)?;
        } else {
            record.set_status(SyncStatus::UploadFailed)?;
        }
        self.store.put_record(&record)?;

        tracing::debug!(
            entity_type,
            entity_id = %change.entity_id,
            conflict_type = ?conflict.conflict_type,
            "upload reported a conflict"
        );
        conflicts.push(conflict);
        // The queue entry stays for after resolution.
        Ok(())
    }

    fn apply_push_failure(
        &self,
        entity_type: &str,
        change: &PendingChange,
        error: SyncError,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        self.queue.mark_failed(entity_type, change.entity_id, &error)?;

        if let Some(mut record) = self.store.get_record(entity_type, change.entity_id)? {
            let status = if change.action == ChangeAction::Delete {
                SyncStatus::DeleteFailed
            } else {
                SyncStatus::UploadFailed
            };
            record.set_status(status)?;
            self.store.put_record(&record)?;
        }

        report.failed.push(FailedChange {
            entity_type: entity_type.into(),
            entity_id: change.entity_id,
            error,
        });
        Ok(())
    }

    async fn download_entity(
        &self,
        entity_type: &str,
        report: &mut SyncReport,
        conflicts: &mut Vec<ConflictRecord>,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        let cursor_ts = self
            .store
            .get_cursor(entity_type)?
            .and_then(|c| c.last_sync_timestamp);

        // A failure here aborts the cycle so the cursor is never advanced
        // past unseen data.
        let records = self
            .retry
            .execute(&self.cancel_flag, || {
                self.remote.fetch_since(entity_type, cursor_ts)
            })
            .await?;

        let total = records.len();
        self.send_progress(SyncPhase::Download, 0, total);

        let mut max_ts: Option<DateTime<Utc>> = None;
        for (index, remote_record) in records.into_iter().enumerate() {
            self.check_cancelled()?;
            max_ts = max_ts.max(Some(remote_record.last_modified));
            self.apply_remote_record(entity_type, remote_record, cursor_ts, report, conflicts)?;
            self.send_progress(SyncPhase::Download, index + 1, total);
        }
        Ok(max_ts)
    }

    fn apply_remote_record(
        &self,
        entity_type: &str,
        remote_record: SyncableRecord,
        cursor_ts: Option<DateTime<Utc>>,
        report: &mut SyncReport,
        conflicts: &mut Vec<ConflictRecord>,
    ) -> SyncResult<()> {
        let local = self.store.get_record(entity_type, remote_record.local_id)?;

        let Some(local) = local else {
            // Unknown locally: tombstones are skipped, live records inserted.
            if !remote_record.is_deleted {
                let mut record = remote_record;
                record.mark_synced(None)?;
                self.store.put_record(&record)?;
                report.downloaded += 1;
            }
            return Ok(());
        };

        if local.sync_status == SyncStatus::Synced {
            // Clean local copy: the remote version wins outright.
            let mut record = remote_record;
            record.local_id = local.local_id;
            record.mark_synced(None)?;
            self.store.put_record(&record)?;
            report.downloaded += 1;
            return Ok(());
        }

        // The local copy itself is pending or conflicted: never overwrite
        // blindly.
        if conflicts.iter().any(|c| c.entity_id() == local.local_id) {
            // Already collected during the upload phase.
            return Ok(());
        }
        match self
            .resolver
            .detect(&local, Some(&remote_record), cursor_ts)?
        {
            Some(conflict) => {
                let mut record = local;
                if record.server_id.is_none() {
                    record.server_id = remote_record.server_id.clone();
                }
                if record.server_id.is_some() {
                    record.set_status(SyncStatus::Conflict)?;
                }
                self.store.put_record(&record)?;
                conflicts.push(conflict);
            }
            None => {
                // No divergence since the cursor. Adopt the remote copy only
                // if the local side has not moved; otherwise the pending
                // local edit proceeds through the next upload.
                if !local.modified_since(cursor_ts) {
                    let mut record = remote_record;
                    record.local_id = local.local_id;
                    record.mark_synced(None)?;
                    self.store.put_record(&record)?;
                    self.queue.mark_succeeded(entity_type, record.local_id)?;
                    report.downloaded += 1;
                }
            }
        }
        Ok(())
    }

    fn resolve_detected(
        &self,
        conflicts: Vec<ConflictRecord>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let total = conflicts.len();
        self.send_progress(SyncPhase::Resolve, 0, total);

        for (index, conflict) in conflicts.into_iter().enumerate() {
            let strategy = self.config.default_strategy;
            let resolution = if strategy.auto_resolves() {
                match self.resolver.resolve(&conflict, strategy) {
                    Ok(resolution) => resolution,
                    // Ambiguous field ownership (e.g. Merge on ModifiedBoth):
                    // left standing for an explicit decision.
                    Err(SyncError::MergeNotApplicable { .. }) => Resolution::Manual,
                    Err(error) => return Err(error),
                }
            } else {
                Resolution::Manual
            };

            if self.apply_resolution(&conflict, resolution)? {
                report.auto_resolved.push(conflict);
            } else {
                report.unresolved.push(conflict);
            }
            self.send_progress(SyncPhase::Resolve, index + 1, total);
        }
        Ok(())
    }

    /// Applies a resolution's effects to the store and queue.
    ///
    /// Returns false when the conflict stays unresolved (`Manual`).
    fn apply_resolution(
        &self,
        conflict: &ConflictRecord,
        resolution: Resolution,
    ) -> SyncResult<bool> {
        let entity_type = conflict.entity_type().to_string();
        let entity_id = conflict.entity_id();

        match resolution {
            Resolution::Manual => Ok(false),
            Resolution::KeepLocal { mut record } => {
                if conflict.conflict_type == ConflictType::DeletedRemotely {
                    // The remote copy is gone; re-create under a fresh
                    // server identity.
                    record.server_id = None;
                    record.set_status(SyncStatus::PendingUpload)?;
                }
                self.store.put_record(&record)?;
                self.enqueue_record(&record)?;
                Ok(true)
            }
            Resolution::Merged { record } => {
                self.store.put_record(&record)?;
                self.enqueue_record(&record)?;
                Ok(true)
            }
            Resolution::KeepServer { record } => {
                match record {
                    Some(record) => self.store.put_record(&record)?,
                    // The remote deletion is adopted locally.
                    None => self.store.remove_record(&entity_type, entity_id)?,
                }
                self.queue.mark_succeeded(&entity_type, entity_id)?;
                Ok(true)
            }
        }
    }

    /// Queues a resolved record for upload, superseding any live entry.
    fn enqueue_record(&self, record: &SyncableRecord) -> SyncResult<()> {
        let action = if record.is_deleted {
            ChangeAction::Delete
        } else if record.server_id.is_some() {
            ChangeAction::Update
        } else {
            ChangeAction::Create
        };
        let mut change = PendingChange::new(
            record.entity_type.clone(),
            record.local_id,
            action,
            (!record.is_deleted).then(|| record.payload.clone()),
            self.config.device_id,
        );
        change.server_id = record.server_id.clone();
        self.queue.enqueue(change)?;
        Ok(())
    }

    // ---- bookkeeping ------------------------------------------------------

    fn claim(&self, types: &[String], scope: &str) -> SyncResult<ClaimGuard<'_>> {
        let mut active = self.active.lock();
        if types.iter().any(|t| active.contains(t)) {
            return Err(SyncError::CycleActive {
                scope: scope.to_string(),
            });
        }
        if active.is_empty() {
            self.cancel_flag.reset();
        }
        for t in types {
            active.insert(t.clone());
        }
        Ok(ClaimGuard {
            active: &self.active,
            types: types.to_vec(),
        })
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel_flag.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        self.state_tx.send_replace(state);
    }

    fn send_progress(&self, phase: SyncPhase, processed: usize, total: usize) {
        self.progress_tx.send_replace(SyncProgress {
            phase: Some(phase),
            processed,
            total,
        });
    }

    fn finish_success(&self, report: &SyncReport) {
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.records_uploaded += report.uploaded as u64;
            stats.records_downloaded += report.downloaded as u64;
            stats.conflicts_detected +=
                (report.auto_resolved.len() + report.unresolved.len()) as u64;
            stats.conflicts_auto_resolved += report.auto_resolved.len() as u64;
            stats.last_sync_at = Some(Utc::now());
            stats.last_error = None;
        }
        self.progress_tx.send_replace(SyncProgress::default());
        tracing::debug!(
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            unresolved = report.unresolved.len(),
            "sync cycle completed"
        );
        self.set_state(SyncState::Completed);
        self.set_state(SyncState::Idle);
    }

    fn finish_error(&self, error: &SyncError) {
        tracing::warn!(error = %error, "sync cycle failed");
        *self.last_error.write() = Some(error.clone());
        self.stats.write().last_error = Some(error.to_string());
        self.progress_tx.send_replace(SyncProgress::default());
        self.set_state(SyncState::Error);
    }

    fn require_record(&self, entity_type: &str, entity_id: Uuid) -> SyncResult<SyncableRecord> {
        self.store
            .get_record(entity_type, entity_id)?
            .ok_or_else(|| SyncError::RecordNotFound {
                entity_type: entity_type.into(),
                entity_id,
            })
    }
}
