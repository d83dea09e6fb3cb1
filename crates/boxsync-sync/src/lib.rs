//! boxsync Sync - Synchronization engine
//!
//! Provides:
//! - Local filesystem watching and debounced change coalescing
//! - Reconciliation of local and remote changes against the local index
//! - A bounded, retrying, per-path serialized transfer scheduler
//! - Credential refresh episodes with ordered replay
//! - Push notification supervision with polling fallback
//! - Quota tracking with transition events
//!
//! ## Modules
//!
//! - [`engine`] - The `SyncEngine` facade: lifecycle, status, events
//! - [`reconciler`] - Plans and commits changes in both directions
//! - [`scheduler`] - Upload/download worker pools
//! - [`debouncer`] - Coalesces raw filesystem events into `ChangeModel`s
//! - [`watcher`] - `notify` adapter producing raw events
//! - [`credentials`] - Credential guard
//! - [`notification`] - Push channel supervisor
//! - [`quota`] - Quota tracker
//! - [`registry`] - Process-wide registry of running engines
//! - [`filesystem`] - Local filesystem adapter (atomic writes, MD5 digests)
//! - [`conflict`] - Conflict copy naming
//!
//! ## Architecture
//!
//! ```text
//!  notify ──► FileWatcher ──► Debouncer ──► driver ──► Reconciler ──► TransferScheduler
//!                                             ▲            │               │
//!  push/poll ──► NotificationSupervisor ──────┘            ▼               ▼
//!                                                      LocalIndex    CredentialGuard ──► REST
//! ```

pub mod conflict;
pub mod credentials;
pub mod debouncer;
pub mod engine;
pub mod filesystem;
pub mod notification;
pub mod quota;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod watcher;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use boxsync_core::domain::{DomainError, SyncMode};
use boxsync_core::ports::RestError;

pub use engine::{EngineOptions, SyncEngine};

/// Why a conflict was reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The server holds a newer revision than the one we sent
    RevisionMismatch,
    /// The item no longer exists on the server
    NotFound,
}

/// Errors that can occur while processing a single change
///
/// Per-item errors never stop the engine; they are recorded on the event
/// and reported through `ItemCompleted`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The change is malformed or the server refused it as such; never retried
    #[error("Structural error: {0}")]
    Structural(String),

    /// Network failure, timeout, throttling or server error; retried
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// Delay requested by the server, if any
        retry_after: Option<Duration>,
    },

    /// Credentials were rejected and could not be refreshed
    #[error("Credential error: {0}")]
    Auth(String),

    /// The server state diverged from what the index expected
    #[error("Conflict ({kind:?}): {message}")]
    Conflict { kind: ConflictKind, message: String },

    /// The local index failed
    #[error("Index error: {0}")]
    Index(String),

    /// A local filesystem operation failed
    #[error("IO error: {0}")]
    Io(String),

    /// The task was cancelled while running
    #[error("Cancelled")]
    Cancelled,

    /// The engine itself is unusable
    #[error(transparent)]
    FatalEngine(#[from] FatalEngineError),
}

impl SyncError {
    /// Shorthand for a transport error without a server-requested delay
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Transport {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Returns true for failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }

    /// Returns true for credential failures
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    /// Wraps an index (storage) failure
    pub fn index(e: anyhow::Error) -> Self {
        SyncError::Index(format!("{e:#}"))
    }

    /// Wraps a local filesystem failure
    pub fn io(e: anyhow::Error) -> Self {
        SyncError::Io(format!("{e:#}"))
    }
}

impl From<RestError> for SyncError {
    fn from(e: RestError) -> Self {
        match e {
            RestError::Unauthorized(msg) => SyncError::Auth(msg),
            RestError::Conflict { message, .. } => SyncError::Conflict {
                kind: ConflictKind::RevisionMismatch,
                message,
            },
            RestError::NotFound(message) => SyncError::Conflict {
                kind: ConflictKind::NotFound,
                message,
            },
            RestError::RateLimited { retry_after } => SyncError::Transport {
                message: "rate limited".to_string(),
                retry_after: Some(Duration::from_secs(retry_after)),
            },
            RestError::Transport(message) => SyncError::transport(message),
            RestError::Rejected { status, message } => {
                SyncError::Structural(format!("server rejected request ({status}): {message}"))
            }
            RestError::InvalidResponse(message) => {
                SyncError::Structural(format!("invalid server response: {message}"))
            }
        }
    }
}

impl From<DomainError> for SyncError {
    fn from(e: DomainError) -> Self {
        SyncError::Structural(e.to_string())
    }
}

/// Engine-level errors returned synchronously from lifecycle calls
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalEngineError {
    #[error("Engine is already started")]
    AlreadyStarted,

    #[error("Engine must be stopped first")]
    NotStopped,

    #[error("Sync mode {0} is not supported")]
    UnsupportedMode(SyncMode),

    #[error("Sync root is not usable: {0}")]
    BadRootPath(String),

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("Local index is corrupted: {0}")]
    IndexCorrupted(String),

    #[error("Another engine is already running on {0}")]
    DuplicateRoot(PathBuf),

    #[error("Local index failed: {0}")]
    Index(String),
}

/// Errors returned by `SyncEngine::start`
pub type StartError = FatalEngineError;
