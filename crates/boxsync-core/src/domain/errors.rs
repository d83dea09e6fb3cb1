//! Domain error types
//!
//! Validation failures raised while constructing domain values. All of them
//! are structural: retrying the same input can never succeed.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid content digest (expected 32 hex characters)
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid server identifier
    #[error("Invalid server uid: {0}")]
    InvalidServerUid(String),

    /// Invalid change cursor
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Path is not within the configured sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),

    /// A change description that violates its own invariants
    #[error("Malformed change: {0}")]
    MalformedChange(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}
