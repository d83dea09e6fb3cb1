//! Local index port (driven/secondary port)
//!
//! The durable record of what the engine last agreed on with the server,
//! plus the event log that makes pending work survive restarts.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - Path entries and quota usage are separate partitions; writing one
//!   never touches the other.
//! - `commit_event` must apply the index change, clear the pending marker
//!   and mark the event committed in a single atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    newtypes::{Cursor, EventId, RelativePath, ServerUid},
    ChangeModel, EventRecord, EventStatus, IndexCommit, IndexEntry, QuotaState,
};

/// Port for the durable local index
#[async_trait]
pub trait ILocalIndex: Send + Sync {
    // --- path entries ---

    /// Look up the entry for a path
    async fn get_entry(&self, path: &RelativePath) -> anyhow::Result<Option<IndexEntry>>;

    /// Look up the entry carrying a server uid
    async fn find_by_server_uid(&self, uid: &ServerUid) -> anyhow::Result<Option<IndexEntry>>;

    /// All entries, ordered by path
    async fn list_entries(&self) -> anyhow::Result<Vec<IndexEntry>>;

    /// Entries strictly below `folder`, ordered by path
    async fn list_descendants(&self, folder: &RelativePath) -> anyhow::Result<Vec<IndexEntry>>;

    // --- events ---

    /// Durably record a change as pending and return its id
    ///
    /// When an entry exists for the change's primary path its
    /// `pending_event_id` is set to the new id.
    async fn record_event(&self, change: &ChangeModel) -> anyhow::Result<EventId>;

    /// Fetch a recorded event
    async fn get_event(&self, id: EventId) -> anyhow::Result<Option<EventRecord>>;

    /// All pending events in submission order
    async fn pending_events(&self) -> anyhow::Result<Vec<EventRecord>>;

    /// Apply `commit`, clear the pending marker for `id` and mark the event
    /// committed, atomically
    async fn commit_event(&self, id: EventId, commit: IndexCommit) -> anyhow::Result<()>;

    /// Move an event to a terminal non-committed status and clear its
    /// pending marker
    async fn finish_event(
        &self,
        id: EventId,
        status: EventStatus,
        error: Option<String>,
    ) -> anyhow::Result<()>;

    /// Delete terminal events completed before `before`; returns the count
    async fn prune_events(&self, before: DateTime<Utc>) -> anyhow::Result<u64>;

    // --- cursor ---

    async fn get_cursor(&self) -> anyhow::Result<Option<Cursor>>;

    async fn set_cursor(&self, cursor: &Cursor) -> anyhow::Result<()>;

    // --- quota partition ---

    async fn load_quota(&self) -> anyhow::Result<Option<QuotaState>>;

    async fn save_quota(&self, state: &QuotaState) -> anyhow::Result<()>;

    // --- maintenance ---

    /// Wipe entries, events and cursor; quota usage is kept
    async fn reset(&self) -> anyhow::Result<()>;
}
