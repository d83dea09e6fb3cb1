//! Local index records
//!
//! [`IndexEntry`] is the durable "last agreed state" for one path.
//! [`EventRecord`] is the durable trace of one change that entered the
//! pipeline, used to resume pending work after a restart and to answer
//! event queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::change::ChangeModel;
use super::errors::DomainError;
use super::newtypes::{Digest128, EventId, RelativePath, ServerUid};

// ============================================================================
// IndexEntry
// ============================================================================

/// What the engine and the server last agreed on for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: RelativePath,
    pub server_uid: ServerUid,
    pub revision: Option<String>,
    /// Content digest; always `None` for folders
    pub hash: Option<Digest128>,
    pub size: u64,
    pub is_folder: bool,
    pub last_synced_at: DateTime<Utc>,
    /// Set while a change for this path is in flight
    pub pending_event_id: Option<EventId>,
}

impl IndexEntry {
    /// Create a committed (non-pending) entry stamped with the current time
    #[must_use]
    pub fn new(
        path: RelativePath,
        server_uid: ServerUid,
        revision: Option<String>,
        hash: Option<Digest128>,
        size: u64,
        is_folder: bool,
    ) -> Self {
        Self {
            path,
            server_uid,
            revision,
            hash,
            size,
            is_folder,
            last_synced_at: Utc::now(),
            pending_event_id: None,
        }
    }

    /// Returns true if a change for this path is in flight
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending_event_id.is_some()
    }

    /// Returns true if the local content matches what was last synced
    #[must_use]
    pub fn content_matches(&self, hash: Option<&Digest128>, size: u64) -> bool {
        !self.is_folder && self.hash.as_ref() == hash && self.size == size
    }
}

// ============================================================================
// EventRecord
// ============================================================================

/// Lifecycle of a recorded change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Recorded, not yet committed (in flight or waiting to resume)
    Pending,
    /// Outcome committed to the index
    Committed,
    /// Terminal failure, reported to the caller
    Failed,
    /// Superseded by a newer change for the same path
    Cancelled,
}

impl EventStatus {
    /// Returns the stored string form
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Committed => "committed",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true if no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "committed" => Ok(EventStatus::Committed),
            "failed" => Ok(EventStatus::Failed),
            "cancelled" => Ok(EventStatus::Cancelled),
            other => Err(DomainError::InvalidId(format!(
                "Unknown event status: {other}"
            ))),
        }
    }
}

/// A change as recorded in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub change: ChangeModel,
    pub status: EventStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == EventStatus::Pending
    }
}

// ============================================================================
// IndexCommit
// ============================================================================

/// An index mutation applied atomically with the completion of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexCommit {
    /// Insert or replace the entry for `entry.path`
    Upsert(IndexEntry),
    /// Remove the entry at `path`, and every entry below it when
    /// `recursive` is set
    Remove { path: RelativePath, recursive: bool },
    /// Move the entry at `from` (and its descendants) to `to`, then apply
    /// the refreshed metadata in `entry`
    Move {
        from: RelativePath,
        to: RelativePath,
        entry: IndexEntry,
    },
    /// Nothing to change; only the event status is updated
    Nothing,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> IndexEntry {
        IndexEntry::new(
            "a.txt".parse().unwrap(),
            ServerUid::new("S1".to_string()).unwrap(),
            Some("r1".to_string()),
            Some(Digest128::from_bytes([1; 16])),
            10,
            false,
        )
    }

    #[test]
    fn test_new_entry_is_not_pending() {
        let e = entry();
        assert!(!e.is_pending());
    }

    #[test]
    fn test_content_matches() {
        let e = entry();
        assert!(e.content_matches(Some(&Digest128::from_bytes([1; 16])), 10));
        assert!(!e.content_matches(Some(&Digest128::from_bytes([2; 16])), 10));
        assert!(!e.content_matches(Some(&Digest128::from_bytes([1; 16])), 11));
    }

    #[test]
    fn test_event_status_roundtrip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Committed,
            EventStatus::Failed,
            EventStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<EventStatus>().is_err());
        assert!(!EventStatus::Pending.is_terminal());
        assert!(EventStatus::Cancelled.is_terminal());
    }
}
