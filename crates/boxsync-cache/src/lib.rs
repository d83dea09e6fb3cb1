//! boxsync Cache - Durable local index
//!
//! SQLite-based storage for:
//! - Path entries (last state agreed with the server)
//! - The event log used to resume pending work and answer event queries
//! - The change-list cursor
//! - Quota usage, in its own table
//!
//! ## Architecture
//!
//! This crate implements the `ILocalIndex` port from `boxsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`IndexPool`] - Connection pool with versioned migrations and
//!   corruption detection
//! - [`SqliteLocalIndex`] - Full `ILocalIndex` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use boxsync_cache::{CacheError, IndexPool, SqliteLocalIndex};
//!
//! # async fn example() -> Result<(), CacheError> {
//! let path = Path::new("/home/user/.local/share/boxsync/index.db");
//! let pool = match IndexPool::open(path).await {
//!     Err(CacheError::Corrupted(_)) => IndexPool::recover(path).await?,
//!     other => other?,
//! };
//! let index = SqliteLocalIndex::new(pool.pool().clone());
//! // Use index as ILocalIndex...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::IndexPool;
pub use repository::SqliteLocalIndex;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// The database file is damaged or is not a database
    #[error("Index is corrupted: {0}")]
    Corrupted(String),

    /// The file was written by a newer schema than this build understands
    #[error("Unsupported schema version {found} (newest known is {supported})")]
    UnsupportedSchema { found: i64, supported: i64 },

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CacheError {
    /// Returns true when the only way forward is rebuilding the index
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            CacheError::Corrupted(_) | CacheError::UnsupportedSchema { .. }
        )
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
