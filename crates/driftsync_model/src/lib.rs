//! # Driftsync Model
//!
//! Record, change-queue, cursor, and conflict types for driftsync.
//!
//! This crate provides:
//! - `SyncableRecord` and its per-record `SyncStatus` lifecycle
//! - `PendingChange` entries for the durable pending-mutation queue
//! - `SyncCursor` watermarks for incremental downloads
//! - `ConflictRecord` classification and resolution strategies
//! - Field-level payload diff and merge helpers
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod cursor;
mod diff;
mod error;
mod record;

pub use change::{ChangeAction, PendingChange};
pub use conflict::{ConflictRecord, ConflictType, ResolutionStrategy};
pub use cursor::SyncCursor;
pub use diff::{changed_fields, merge_payloads};
pub use error::{ModelError, ModelResult};
pub use record::{SyncStatus, SyncableRecord};
