//! Engine status, modes and outbound events

use serde::{Deserialize, Serialize};
use std::fmt;

use super::newtypes::{EventId, RelativePath};
use super::transfer::TransferSnapshot;

/// How the engine keeps the folder in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every item is mirrored locally and kept up to date
    LiveSync,
    /// Placeholders hydrated on access; not supported by this engine
    OnDemand,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::LiveSync => f.write_str("live_sync"),
            SyncMode::OnDemand => f.write_str("on_demand"),
        }
    }
}

/// Coarse engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Nothing to do
    Idle,
    /// At least one transfer is running
    Syncing,
    /// Work is queued or retrying but nothing is running right now
    Pending,
    /// The engine hit an engine-level error and needs a restart
    Error,
}

/// Snapshot returned by `current_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: EngineState,
    pub uploading: Vec<TransferSnapshot>,
    pub downloading: Vec<TransferSnapshot>,
}

impl SyncStatus {
    /// An idle status with no transfers
    #[must_use]
    pub fn idle() -> Self {
        Self {
            state: EngineState::Idle,
            uploading: Vec::new(),
            downloading: Vec::new(),
        }
    }
}

/// Final outcome of one change, reported through [`EngineEvent::ItemCompleted`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum ItemOutcome {
    Committed,
    /// Nothing needed to change
    Skipped,
    Cancelled,
    Failed(String),
}

/// Events published by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    /// Push and/or poll channel failures, aggregated per poll cycle
    PushNotificationError {
        push: Option<String>,
        poll: Option<String>,
    },
    QuotaExceeded {
        usage_bytes: u64,
        limit_bytes: u64,
    },
    QuotaReturnedNormal {
        usage_bytes: u64,
        limit_bytes: u64,
    },
    LiveSyncStarted,
    LiveSyncStopped,
    /// A change reached a terminal state
    ItemCompleted {
        event_id: EventId,
        path: Option<RelativePath>,
        outcome: ItemOutcome,
    },
}
