//! Transfer task types
//!
//! Tasks themselves are owned by the transfer scheduler; callers only ever
//! see [`TransferSnapshot`]s.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::change::{ChangeModel, Direction};
use super::newtypes::{EventId, RelativePath};

/// Which worker pool a task runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl From<Direction> for TransferDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::ToServer => TransferDirection::Upload,
            Direction::FromServer => TransferDirection::Download,
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => f.write_str("upload"),
            TransferDirection::Download => f.write_str("download"),
        }
    }
}

/// Task lifecycle
///
/// ```text
/// Queued ──► Running ──► Committed
///              │  ▲
///              ▼  │
///            Retrying ──► Failed
///
/// (any non-terminal) ──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    Running,
    Retrying,
    Committed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Committed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            TransferStatus::Queued => 0,
            TransferStatus::Running => 1,
            TransferStatus::Retrying => 2,
            TransferStatus::Committed => 3,
            TransferStatus::Failed => 4,
            TransferStatus::Cancelled => 5,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TransferStatus::Queued,
            1 => TransferStatus::Running,
            2 => TransferStatus::Retrying,
            3 => TransferStatus::Committed,
            4 => TransferStatus::Failed,
            _ => TransferStatus::Cancelled,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Running => "running",
            TransferStatus::Retrying => "retrying",
            TransferStatus::Committed => "committed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work handed to the scheduler
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub event_id: EventId,
    pub direction: TransferDirection,
    pub item: ChangeModel,
    /// The path whose lock serializes this task
    pub path: RelativePath,
}

impl TransferTask {
    /// Build a task for `item`, deriving the lane from its direction
    ///
    /// Returns `None` when the change names no path.
    #[must_use]
    pub fn new(event_id: EventId, item: ChangeModel) -> Option<Self> {
        let path = item.primary_path()?.clone();
        Some(Self {
            event_id,
            direction: item.direction.into(),
            item,
            path,
        })
    }
}

/// Read-only view of a task, exposed through engine status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub event_id: EventId,
    pub path: RelativePath,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub attempt: u32,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_maps_to_lane() {
        assert_eq!(
            TransferDirection::from(Direction::ToServer),
            TransferDirection::Upload
        );
        assert_eq!(
            TransferDirection::from(Direction::FromServer),
            TransferDirection::Download
        );
    }

    #[test]
    fn test_status_u8_roundtrip() {
        for status in [
            TransferStatus::Queued,
            TransferStatus::Running,
            TransferStatus::Retrying,
            TransferStatus::Committed,
            TransferStatus::Failed,
            TransferStatus::Cancelled,
        ] {
            assert_eq!(TransferStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_task_uses_primary_path() {
        let change = ChangeModel::renamed(
            Direction::ToServer,
            "a".parse().unwrap(),
            "b".parse().unwrap(),
            false,
        );
        let task = TransferTask::new(EventId::new(1), change).unwrap();
        assert_eq!(task.path.as_str(), "b");
        assert_eq!(task.direction, TransferDirection::Upload);
    }
}
