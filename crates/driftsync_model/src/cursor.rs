//! Download watermarks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// High-water mark of remote changes already applied for one entity type.
///
/// Owned exclusively by the orchestrator and advanced only after a download
/// phase completes without fatal error, so an aborted cycle re-attempts the
/// same delta window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Entity family this cursor tracks.
    pub entity_type: String,
    /// Latest remote `last_modified` already applied locally.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// When the last full cycle for this entity type completed.
    pub last_successful_sync_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Creates an empty cursor (first sync fetches all records).
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            last_sync_timestamp: None,
            last_successful_sync_at: None,
        }
    }

    /// Advances the watermark, never moving it backwards.
    pub fn advance(&mut self, observed: DateTime<Utc>) {
        match self.last_sync_timestamp {
            Some(current) if current >= observed => {}
            _ => self.last_sync_timestamp = Some(observed),
        }
    }

    /// Records a completed cycle.
    pub fn mark_success(&mut self) {
        self.last_successful_sync_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn advance_is_monotonic() {
        let mut cursor = SyncCursor::new("note");
        assert!(cursor.last_sync_timestamp.is_none());

        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 6).unwrap();

        cursor.advance(t2);
        assert_eq!(cursor.last_sync_timestamp, Some(t2));

        // An older observation never moves the watermark backwards.
        cursor.advance(t1);
        assert_eq!(cursor.last_sync_timestamp, Some(t2));
    }

    #[test]
    fn mark_success_stamps_time() {
        let mut cursor = SyncCursor::new("note");
        cursor.mark_success();
        assert!(cursor.last_successful_sync_at.is_some());
    }
}
