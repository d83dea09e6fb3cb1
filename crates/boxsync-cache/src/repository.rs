//! SQLite implementation of ILocalIndex
//!
//! This module provides the concrete SQLite-based implementation of the
//! local index port defined in boxsync-core. It handles domain type
//! serialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type    | SQL Type | Strategy                                   |
//! |----------------|----------|--------------------------------------------|
//! | RelativePath   | TEXT     | `.as_str()` / `RelativePath::new()`         |
//! | ServerUid      | TEXT     | `.as_str()` / `ServerUid::new()`            |
//! | Digest128      | TEXT     | lowercase hex / `Digest128::from_hex()`     |
//! | EventId        | INTEGER  | `.as_i64()` / `EventId::new()`              |
//! | DateTime<Utc>  | TEXT     | RFC 3339 with microseconds, `Z` suffix      |
//! | ChangeModel    | TEXT     | serde_json serialization                    |
//! | EventStatus    | TEXT     | `.as_str()` / `FromStr`                     |
//!
//! Timestamps always use the same fixed-width format so they compare
//! correctly as strings (used by `prune_events`).
//!
//! ## Pending markers
//!
//! An event is filed under its *subject path*: the source for deletes and
//! renames, the item itself otherwise. The entry at that path carries the
//! newest pending event id. Whenever an event leaves `pending`, every marker
//! pointing at it is recomputed from the events still pending for the
//! entry's path.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use boxsync_core::domain::{
    newtypes::{Cursor, Digest128, EventId, RelativePath, ServerUid},
    ChangeKind, ChangeModel, EventRecord, EventStatus, IndexCommit, IndexEntry, QuotaState,
};
use boxsync_core::ports::ILocalIndex;

use crate::CacheError;

const CURSOR_KEY: &str = "cursor";

/// SQLite-based implementation of the local index port
///
/// All operations are performed through a connection pool; every multi-row
/// mutation runs inside one transaction.
pub struct SqliteLocalIndex {
    pool: SqlitePool,
}

impl SqliteLocalIndex {
    /// Creates a new index instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

/// The path an event is filed under
fn subject_path(change: &ChangeModel) -> Option<&RelativePath> {
    match change.kind {
        ChangeKind::Deleted | ChangeKind::Renamed => change.old_path.as_ref(),
        ChangeKind::Created | ChangeKind::Modified => change.new_path.as_ref(),
    }
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn entry_from_row(row: &SqliteRow) -> Result<IndexEntry, CacheError> {
    let path: String = row.try_get("path")?;
    let server_uid: String = row.try_get("server_uid")?;
    let revision: Option<String> = row.try_get("revision")?;
    let hash: Option<String> = row.try_get("hash")?;
    let size: i64 = row.try_get("size")?;
    let is_folder: bool = row.try_get("is_folder")?;
    let last_synced_at: String = row.try_get("last_synced_at")?;
    let pending_event_id: Option<i64> = row.try_get("pending_event_id")?;

    Ok(IndexEntry {
        path: RelativePath::new(path)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?,
        server_uid: ServerUid::new(server_uid)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?,
        revision,
        hash: hash
            .map(|h| Digest128::from_hex(&h))
            .transpose()
            .map_err(|e| CacheError::SerializationError(e.to_string()))?,
        size: size.max(0) as u64,
        is_folder,
        last_synced_at: parse_datetime(&last_synced_at)?,
        pending_event_id: pending_event_id.map(EventId::new),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord, CacheError> {
    let id: i64 = row.try_get("id")?;
    let change: String = row.try_get("change")?;
    let status: String = row.try_get("status")?;
    let error: Option<String> = row.try_get("error")?;
    let recorded_at: String = row.try_get("recorded_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(EventRecord {
        id: EventId::new(id),
        change: serde_json::from_str(&change).map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse change of event {id}: {e}"))
        })?,
        status: status
            .parse()
            .map_err(|e: boxsync_core::domain::DomainError| {
                CacheError::SerializationError(e.to_string())
            })?,
        error,
        recorded_at: parse_datetime(&recorded_at)?,
        completed_at: parse_optional_datetime(completed_at)?,
    })
}

// ============================================================================
// Transaction helpers
// ============================================================================

async fn upsert_entry(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &IndexEntry,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT OR REPLACE INTO entries \
         (path, server_uid, revision, hash, size, is_folder, last_synced_at, pending_event_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.path.as_str())
    .bind(entry.server_uid.as_str())
    .bind(&entry.revision)
    .bind(entry.hash.as_ref().map(|h| h.to_hex()))
    .bind(entry.size as i64)
    .bind(entry.is_folder)
    .bind(format_datetime(&entry.last_synced_at))
    .bind(entry.pending_event_id.map(|id| id.as_i64()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn remove_entries(
    tx: &mut Transaction<'_, Sqlite>,
    path: &RelativePath,
    recursive: bool,
) -> Result<u64, CacheError> {
    let result = if recursive {
        sqlx::query(
            "DELETE FROM entries \
             WHERE path = ? OR substr(path, 1, length(?) + 1) = ? || '/'",
        )
        .bind(path.as_str())
        .bind(path.as_str())
        .bind(path.as_str())
        .execute(&mut **tx)
        .await?
    } else {
        sqlx::query("DELETE FROM entries WHERE path = ?")
            .bind(path.as_str())
            .execute(&mut **tx)
            .await?
    };
    Ok(result.rows_affected())
}

/// Rewrites `from/...` descendants to `to/...`
async fn rebase_descendants(
    tx: &mut Transaction<'_, Sqlite>,
    from: &RelativePath,
    to: &RelativePath,
) -> Result<u64, CacheError> {
    let result = sqlx::query(
        "UPDATE entries SET path = ? || substr(path, length(?) + 1) \
         WHERE substr(path, 1, length(?) + 1) = ? || '/'",
    )
    .bind(to.as_str())
    .bind(from.as_str())
    .bind(from.as_str())
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

/// Recomputes pending markers on entries at `path` or pointing at `id`
async fn refresh_markers(
    tx: &mut Transaction<'_, Sqlite>,
    id: EventId,
    path: Option<&RelativePath>,
) -> Result<(), CacheError> {
    sqlx::query(
        "UPDATE entries SET pending_event_id = \
           (SELECT MAX(e.id) FROM events e \
            WHERE e.path = entries.path AND e.status = 'pending') \
         WHERE pending_event_id = ? OR path = ?",
    )
    .bind(id.as_i64())
    .bind(path.map(|p| p.as_str()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn event_status(
    tx: &mut Transaction<'_, Sqlite>,
    id: EventId,
) -> Result<Option<EventStatus>, CacheError> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM events WHERE id = ?")
        .bind(id.as_i64())
        .fetch_optional(&mut **tx)
        .await?;
    status
        .map(|s| {
            s.parse::<EventStatus>()
                .map_err(|e| CacheError::SerializationError(e.to_string()))
        })
        .transpose()
}

// ============================================================================
// ILocalIndex implementation
// ============================================================================

#[async_trait::async_trait]
impl ILocalIndex for SqliteLocalIndex {
    // --- path entries ---

    async fn get_entry(&self, path: &RelativePath) -> anyhow::Result<Option<IndexEntry>> {
        let row = sqlx::query("SELECT * FROM entries WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(entry_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_server_uid(&self, uid: &ServerUid) -> anyhow::Result<Option<IndexEntry>> {
        let row = sqlx::query("SELECT * FROM entries WHERE server_uid = ? LIMIT 1")
            .bind(uid.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(entry_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_entries(&self) -> anyhow::Result<Vec<IndexEntry>> {
        let rows = sqlx::query("SELECT * FROM entries ORDER BY path ASC")
            .fetch_all(&self.pool)
            .await?;

        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn list_descendants(&self, folder: &RelativePath) -> anyhow::Result<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM entries \
             WHERE substr(path, 1, length(?) + 1) = ? || '/' \
             ORDER BY path ASC",
        )
        .bind(folder.as_str())
        .bind(folder.as_str())
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // --- events ---

    async fn record_event(&self, change: &ChangeModel) -> anyhow::Result<EventId> {
        let json = serde_json::to_string(change)
            .map_err(|e| anyhow::anyhow!("Failed to serialize change: {}", e))?;
        let subject = subject_path(change);

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO events (path, change, status, recorded_at) VALUES (?, ?, 'pending', ?)",
        )
        .bind(subject.map(|p| p.as_str()))
        .bind(&json)
        .bind(format_datetime(&Utc::now()))
        .execute(&mut *tx)
        .await?;
        let id = EventId::new(result.last_insert_rowid());

        if let Some(path) = subject {
            sqlx::query("UPDATE entries SET pending_event_id = ? WHERE path = ?")
                .bind(id.as_i64())
                .bind(path.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(event_id = %id, change = %change, "Recorded event");
        Ok(id)
    }

    async fn get_event(&self, id: EventId) -> anyhow::Result<Option<EventRecord>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(event_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn pending_events(&self) -> anyhow::Result<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT * FROM events WHERE status = 'pending' ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    async fn commit_event(&self, id: EventId, commit: IndexCommit) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        match event_status(&mut tx, id).await? {
            Some(EventStatus::Pending) => {}
            Some(other) => anyhow::bail!("Event {} is already {}", id, other),
            None => anyhow::bail!("Unknown event {}", id),
        }

        let touched = match &commit {
            IndexCommit::Upsert(entry) => {
                upsert_entry(&mut tx, entry).await?;
                Some(entry.path.clone())
            }
            IndexCommit::Remove { path, recursive } => {
                let removed = remove_entries(&mut tx, path, *recursive).await?;
                tracing::trace!(path = %path, removed, "Removed index entries");
                None
            }
            IndexCommit::Move { from, to, entry } => {
                remove_entries(&mut tx, to, true).await?;
                let moved = rebase_descendants(&mut tx, from, to).await?;
                remove_entries(&mut tx, from, false).await?;
                upsert_entry(&mut tx, entry).await?;
                tracing::trace!(from = %from, to = %to, moved, "Moved index subtree");
                Some(entry.path.clone())
            }
            IndexCommit::Nothing => None,
        };

        sqlx::query("UPDATE events SET status = 'committed', error = NULL, completed_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;

        refresh_markers(&mut tx, id, touched.as_ref()).await?;

        tx.commit().await?;

        tracing::debug!(event_id = %id, "Committed event");
        Ok(())
    }

    async fn finish_event(
        &self,
        id: EventId,
        status: EventStatus,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        if !status.is_terminal() || status == EventStatus::Committed {
            anyhow::bail!("finish_event cannot move an event to {}", status);
        }

        let mut tx = self.pool.begin().await?;

        match event_status(&mut tx, id).await? {
            Some(EventStatus::Pending) => {}
            Some(current) => {
                tracing::debug!(event_id = %id, %current, "Event already finished");
                return Ok(());
            }
            None => anyhow::bail!("Unknown event {}", id),
        }

        sqlx::query("UPDATE events SET status = ?, error = ?, completed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&error)
            .bind(format_datetime(&Utc::now()))
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await?;

        refresh_markers(&mut tx, id, None).await?;

        tx.commit().await?;

        tracing::debug!(event_id = %id, %status, "Finished event");
        Ok(())
    }

    async fn prune_events(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM events WHERE status != 'pending' AND completed_at IS NOT NULL \
             AND completed_at < ?",
        )
        .bind(format_datetime(&before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // --- cursor ---

    async fn get_cursor(&self) -> anyhow::Result<Option<Cursor>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
            .bind(CURSOR_KEY)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.map(Cursor::new).transpose()?)
    }

    async fn set_cursor(&self, cursor: &Cursor) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO sync_state (key, value) VALUES (?, ?)")
            .bind(CURSOR_KEY)
            .bind(cursor.as_str())
            .execute(&self.pool)
            .await?;

        tracing::trace!(cursor = %cursor, "Saved change-list cursor");
        Ok(())
    }

    // --- quota partition ---

    async fn load_quota(&self) -> anyhow::Result<Option<QuotaState>> {
        let row = sqlx::query("SELECT usage_bytes, limit_bytes, exceeded FROM quota_usage WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let usage: i64 = r.try_get("usage_bytes")?;
                let limit: i64 = r.try_get("limit_bytes")?;
                let exceeded: bool = r.try_get("exceeded")?;
                Ok(Some(QuotaState {
                    usage_bytes: usage.max(0) as u64,
                    limit_bytes: limit.max(0) as u64,
                    exceeded,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_quota(&self, state: &QuotaState) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO quota_usage (id, usage_bytes, limit_bytes, exceeded, updated_at) \
             VALUES (1, ?, ?, ?, ?)",
        )
        .bind(state.usage_bytes as i64)
        .bind(state.limit_bytes as i64)
        .bind(state.exceeded)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- maintenance ---

    async fn reset(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entries").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM events").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM sync_state WHERE key = ?")
            .bind(CURSOR_KEY)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("Local index reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxsync_core::domain::Direction;

    fn rel(s: &str) -> RelativePath {
        s.parse().unwrap()
    }

    #[test]
    fn test_subject_path_uses_source_for_rename_and_delete() {
        let rename = ChangeModel::renamed(Direction::ToServer, rel("a"), rel("b"), false);
        assert_eq!(subject_path(&rename), Some(&rel("a")));

        let delete = ChangeModel::deleted(Direction::ToServer, rel("c"), false);
        assert_eq!(subject_path(&delete), Some(&rel("c")));

        let create = ChangeModel::created(Direction::ToServer, rel("d"), true);
        assert_eq!(subject_path(&create), Some(&rel("d")));
    }

    #[test]
    fn test_datetime_format_is_fixed_width() {
        let a = format_datetime(&"2026-01-02T03:04:05Z".parse().unwrap());
        let b = format_datetime(&"2026-01-02T03:04:05.5Z".parse().unwrap());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&a).unwrap().to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }
}
