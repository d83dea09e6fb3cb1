//! Database connection pool management
//!
//! Provides a wrapper around SQLx's SqlitePool with:
//! - Automatic directory creation for database files
//! - WAL journal mode for concurrent reads
//! - Versioned schema migrations tracked in `PRAGMA user_version`
//! - Integrity checking at open, and rebuild of a corrupted file
//! - In-memory mode for testing

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Ordered schema migrations: `(version, name, sql)`
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "initial", include_str!("migrations/0001_initial.sql")),
    (
        2,
        "quota_usage",
        include_str!("migrations/0002_quota_usage.sql"),
    ),
];

/// Newest schema version this build knows how to use
pub const SCHEMA_VERSION: i64 = 2;

/// SQLite result codes meaning the file is damaged or not a database
const CORRUPTION_CODES: &[&str] = &["11", "26"];

/// Manages a pool of SQLite connections for the local index
///
/// The pool is configured with:
/// - WAL journal mode for concurrent read access
/// - 5 max connections for file-based databases
/// - 1 connection for in-memory databases (required for data persistence)
/// - 5-second busy timeout to handle write contention
pub struct IndexPool {
    pool: SqlitePool,
}

impl IndexPool {
    /// Opens (or creates) the index file at `db_path`
    ///
    /// This will:
    /// 1. Create parent directories if they don't exist
    /// 2. Create the database file if it doesn't exist
    /// 3. Enable WAL journal mode
    /// 4. Verify file integrity
    /// 5. Run pending schema migrations
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupted` if the file is damaged,
    /// `CacheError::UnsupportedSchema` if it was written by a newer build,
    /// `CacheError::ConnectionFailed` if the connection cannot be established,
    /// or `CacheError::MigrationFailed` if a migration fails.
    pub async fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| classify_open_error(e, db_path))?;

        Self::check_integrity(&pool).await?;
        Self::run_migrations(&pool).await?;

        tracing::info!(
            path = %db_path.display(),
            schema_version = SCHEMA_VERSION,
            "Index pool initialized"
        );

        Ok(Self { pool })
    }

    /// Discards the index file at `db_path` and opens a fresh one
    ///
    /// Used after [`IndexPool::open`] reported corruption. The new index is
    /// empty, so the next engine start performs a full remote listing.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the old files cannot be
    /// removed, or any error of [`IndexPool::open`].
    pub async fn recover(db_path: &Path) -> Result<Self, CacheError> {
        tracing::warn!(path = %db_path.display(), "Rebuilding local index");

        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = db_path.as_os_str().to_owned();
            candidate.push(suffix);
            match std::fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::ConnectionFailed(format!(
                        "Failed to remove {}: {}",
                        Path::new(&candidate).display(),
                        e
                    )))
                }
            }
        }

        Self::open(db_path).await
    }

    /// Creates an in-memory database pool for testing
    ///
    /// Uses a single connection to ensure data persistence across queries
    /// (SQLite in-memory databases are per-connection).
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the connection cannot be established,
    /// or `CacheError::MigrationFailed` if schema migrations fail.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::debug!("In-memory index pool initialized");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current schema version stored in the file
    pub async fn schema_version(&self) -> Result<i64, CacheError> {
        Ok(sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Closes every connection in the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Runs `PRAGMA integrity_check` and maps any finding to `Corrupted`
    async fn check_integrity(pool: &SqlitePool) -> Result<(), CacheError> {
        let verdict: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(pool)
            .await
            .map_err(|e| match corruption_message(&e) {
                Some(msg) => CacheError::Corrupted(msg),
                None => CacheError::QueryFailed(e.to_string()),
            })?;

        if verdict != "ok" {
            return Err(CacheError::Corrupted(verdict));
        }
        Ok(())
    }

    /// Applies every migration newer than the stored `user_version`
    ///
    /// Each migration and its version bump run in one transaction, so a
    /// crash mid-migration leaves the previous version intact.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(pool)
            .await
            .map_err(|e| match corruption_message(&e) {
                Some(msg) => CacheError::Corrupted(msg),
                None => CacheError::MigrationFailed(e.to_string()),
            })?;

        if current > SCHEMA_VERSION {
            return Err(CacheError::UnsupportedSchema {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        for (version, name, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(|e| {
                CacheError::MigrationFailed(format!("Migration {version} ({name}) failed: {e}"))
            })?;
            let bump = format!("PRAGMA user_version = {version}");
            sqlx::raw_sql(&bump).execute(&mut *tx).await.map_err(|e| {
                CacheError::MigrationFailed(format!("Failed to record version {version}: {e}"))
            })?;
            tx.commit().await?;
            tracing::debug!(version, name, "Applied index migration");
        }

        Ok(())
    }
}

/// Returns a description when `e` means the file is damaged
fn corruption_message(e: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db) = e {
        let code_matches = db
            .code()
            .map(|c| CORRUPTION_CODES.contains(&c.as_ref()))
            .unwrap_or(false);
        let msg = db.message().to_ascii_lowercase();
        if code_matches || msg.contains("not a database") || msg.contains("malformed") {
            return Some(db.message().to_string());
        }
    }
    None
}

fn classify_open_error(e: sqlx::Error, db_path: &Path) -> CacheError {
    match corruption_message(&e) {
        Some(msg) => CacheError::Corrupted(format!("{}: {}", db_path.display(), msg)),
        None => CacheError::ConnectionFailed(format!(
            "Failed to connect to database at {}: {}",
            db_path.display(),
            e
        )),
    }
}
