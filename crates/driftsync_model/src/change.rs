//! Pending-change queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of local mutation a queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    /// The record has never been accepted by the server.
    Create,
    /// The record exists remotely and was edited locally.
    Update,
    /// The record exists remotely and was deleted locally.
    Delete,
}

/// An outstanding local mutation awaiting upload.
///
/// At most one live entry exists per `(entity_type, entity_id)`; re-enqueuing
/// an entity supersedes its prior entry. Content conflicts are resolved later
/// against the remote copy, not at the queue level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Entity family.
    pub entity_type: String,
    /// The record's local id.
    pub entity_id: Uuid,
    /// Mutation kind.
    pub action: ChangeAction,
    /// Remote identity of the record, when it has one (updates and deletes).
    pub server_id: Option<String>,
    /// Serialized payload snapshot taken at enqueue time.
    pub payload: Option<Value>,
    /// Scheduling priority; lower sorts first.
    pub priority: i32,
    /// Count of prior failed upload attempts.
    pub attempts: u32,
    /// Message from the most recent failure, if any.
    pub last_error: Option<String>,
    /// Device that originated the change.
    pub device_id: Uuid,
    /// When the entry was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Entry exceeded its failure ceiling and awaits manual retry.
    pub dead_letter: bool,
}

impl PendingChange {
    /// Creates a new queue entry with default priority.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: Uuid,
        action: ChangeAction,
        payload: Option<Value>,
        device_id: Uuid,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            action,
            server_id: None,
            payload,
            priority: 0,
            attempts: 0,
            last_error: None,
            device_id,
            enqueued_at: Utc::now(),
            dead_letter: false,
        }
    }

    /// Sets the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the record's remote identity.
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Records a failed attempt.
    ///
    /// Returns true if the entry crossed `ceiling` and was dead-lettered.
    pub fn record_failure(&mut self, error: impl Into<String>, ceiling: u32) -> bool {
        self.attempts += 1;
        self.last_error = Some(error.into());
        if self.attempts > ceiling {
            self.dead_letter = true;
        }
        self.dead_letter
    }

    /// Clears failure bookkeeping so the entry re-enters normal retry flow.
    pub fn reset_failures(&mut self) {
        self.attempts = 0;
        self.last_error = None;
        self.dead_letter = false;
    }

    /// Absorbs a newer change for the same entity.
    ///
    /// The payload and action come from the newer change; the original
    /// enqueue time and priority are kept so repeated edits do not lose their
    /// place in the queue. A `Create` followed by an `Update` stays a
    /// `Create`, since the server has still never seen the record. Failure
    /// bookkeeping resets: the superseding content gets a fresh retry budget.
    pub fn supersede_with(&mut self, newer: PendingChange) {
        self.action = match (self.action, newer.action) {
            (ChangeAction::Create, ChangeAction::Update) => ChangeAction::Create,
            (_, action) => action,
        };
        self.payload = newer.payload;
        self.server_id = match self.action {
            // A re-create must not carry a stale remote identity.
            ChangeAction::Create => newer.server_id,
            _ => newer.server_id.or(self.server_id.take()),
        };
        self.device_id = newer.device_id;
        self.reset_failures();
    }
}
