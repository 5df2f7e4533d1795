//! # Driftsync Engine
//!
//! Offline-first sync core for driftsync.
//!
//! This crate provides:
//! - Sync state machine (idle → uploading → downloading → resolving)
//! - Durable pending-change queue with dead-lettering
//! - Retry with bounded exponential backoff and jitter
//! - Bounded-size batch transfers with per-item outcomes
//! - Conflict detection and resolution strategies
//! - Store and remote-service trait seams with in-memory test doubles
//!
//! ## Architecture
//!
//! The engine implements an **upload-then-download** synchronization model:
//! 1. Drain the pending queue to the server in bounded batches
//! 2. Pull remote deltas since the per-entity-type cursor
//! 3. Resolve conflicts with the configured default strategy
//! 4. Advance the cursor only after a clean download phase
//!
//! ## Key Invariants
//!
//! - A record without a server identity is never `Synced`
//! - At most one live queue entry per `(entity_type, entity_id)`
//! - One active cycle per entity type; disjoint types may sync concurrently
//! - Cancellation lands between chunks, never mid-call
//! - A failed cycle never advances the cursor

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod cancel;
mod config;
mod error;
mod orchestrator;
mod queue;
mod remote;
mod resolver;
mod retry;
mod store;

pub use batch::{BatchOutcome, BatchProcessor, ChunkOperation};
pub use cancel::CancelFlag;
pub use config::{RetryConfig, SyncConfig};
pub use error::{ConflictDescriptor, ErrorClass, FieldError, SyncError, SyncResult};
pub use orchestrator::{
    FailedChange, SyncOrchestrator, SyncPhase, SyncProgress, SyncReport, SyncState, SyncStats,
};
pub use queue::{EnqueueOutcome, PendingChangeQueue};
pub use remote::{MockRemote, PushOutcome, RemoteService};
pub use resolver::{ConflictResolver, Resolution};
pub use retry::RetryPolicy;
pub use store::{LocalStore, MemoryStore};
