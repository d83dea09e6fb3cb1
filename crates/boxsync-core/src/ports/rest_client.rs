//! REST client port (driven/secondary port)
//!
//! This module defines the interface the engine uses to talk to the sync
//! server: one-off create/modify/delete/move operations, metadata lookups,
//! the change list, quota, and chunked content transfer.
//!
//! ## Design Notes
//!
//! - Unlike the other ports this one returns a typed [`RestError`]: the
//!   engine's retry, credential and conflict handling all branch on the
//!   error class, so adapters must classify failures.
//! - Requests carry paths and identifiers only; adapters own the wire
//!   format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    newtypes::{Cursor, DeviceId, Digest128, RelativePath, ServerUid, SyncboxId},
    Credentials,
};

// ============================================================================
// RestError
// ============================================================================

/// Classified failure of a server call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RestError {
    /// Credentials rejected or expired (HTTP 401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Revision mismatch or conflicting state (HTTP 409/412)
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        /// Server revision when the response carried one
        current_revision: Option<String>,
    },

    /// Item does not exist on the server (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Throttled (HTTP 429); retry after the given number of seconds
    #[error("Rate limited: retry after {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    /// Timeout, connection failure or 5xx
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request refused as malformed (other 4xx)
    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Response body could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RestError {
    /// Returns true for credential failures handled by the credential guard
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, RestError::Unauthorized(_))
    }

    /// Returns true for failures worth retrying with backoff
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RestError::Transport(_) | RestError::RateLimited { .. }
        )
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Identity attached to every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub device_id: DeviceId,
    pub syncbox_id: SyncboxId,
}

/// Metadata of a file sent with create/modify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub hash: Digest128,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A single server operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestRequest {
    /// Create a file; `idempotency_key` lets the server drop replays
    CreateFile {
        path: RelativePath,
        metadata: FileMetadata,
        idempotency_key: String,
    },
    CreateFolder {
        path: RelativePath,
        idempotency_key: String,
    },
    ModifyFile {
        server_uid: ServerUid,
        path: RelativePath,
        metadata: FileMetadata,
        revision: Option<String>,
    },
    Delete {
        server_uid: ServerUid,
        path: RelativePath,
        is_folder: bool,
        revision: Option<String>,
    },
    Move {
        server_uid: ServerUid,
        from: RelativePath,
        to: RelativePath,
        is_folder: bool,
        revision: Option<String>,
    },
    /// Current server metadata for a path
    GetMetadata { path: RelativePath },
    /// Change list since a cursor; `None` lists everything
    ChangesSince { cursor: Option<Cursor> },
    GetQuota,
}

impl RestRequest {
    /// Short name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RestRequest::CreateFile { .. } => "create_file",
            RestRequest::CreateFolder { .. } => "create_folder",
            RestRequest::ModifyFile { .. } => "modify_file",
            RestRequest::Delete { .. } => "delete",
            RestRequest::Move { .. } => "move",
            RestRequest::GetMetadata { .. } => "get_metadata",
            RestRequest::ChangesSince { .. } => "changes_since",
            RestRequest::GetQuota => "get_quota",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Server view of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerItem {
    pub uid: ServerUid,
    pub path: RelativePath,
    pub revision: Option<String>,
    pub hash: Option<Digest128>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    /// Set on create/modify responses when the server still needs the
    /// content bytes
    #[serde(default)]
    pub content_required: bool,
}

/// One page of the change list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage {
    pub items: Vec<ServerItem>,
    pub cursor: Cursor,
    pub has_more: bool,
}

/// Usage reading of the syncbox's plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReading {
    pub usage_bytes: u64,
    pub limit_bytes: u64,
}

/// Result of [`IRestClient::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestResponse {
    Item(ServerItem),
    /// Delete acknowledged
    Removed,
    Changes(ChangePage),
    Quota(QuotaReading),
}

impl RestResponse {
    /// Expect an item response
    ///
    /// # Errors
    /// Returns `RestError::InvalidResponse` for any other response kind
    pub fn into_item(self) -> Result<ServerItem, RestError> {
        match self {
            RestResponse::Item(item) => Ok(item),
            other => Err(RestError::InvalidResponse(format!(
                "expected an item, got {other:?}"
            ))),
        }
    }

    /// Expect a change page
    ///
    /// # Errors
    /// Returns `RestError::InvalidResponse` for any other response kind
    pub fn into_changes(self) -> Result<ChangePage, RestError> {
        match self {
            RestResponse::Changes(page) => Ok(page),
            other => Err(RestError::InvalidResponse(format!(
                "expected a change page, got {other:?}"
            ))),
        }
    }

    /// Expect a quota reading
    ///
    /// # Errors
    /// Returns `RestError::InvalidResponse` for any other response kind
    pub fn into_quota(self) -> Result<QuotaReading, RestError> {
        match self {
            RestResponse::Quota(q) => Ok(q),
            other => Err(RestError::InvalidResponse(format!(
                "expected a quota reading, got {other:?}"
            ))),
        }
    }
}

/// One slice of file content being uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    pub server_uid: ServerUid,
    pub offset: u64,
    pub total_size: u64,
    pub data: Vec<u8>,
}

// ============================================================================
// IRestClient trait
// ============================================================================

/// Port for the sync server's REST API
#[async_trait]
pub trait IRestClient: Send + Sync {
    /// Execute a one-off operation or query
    async fn execute(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
        request: &RestRequest,
    ) -> Result<RestResponse, RestError>;

    /// Upload one chunk of file content
    async fn upload_chunk(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
        chunk: &UploadChunk,
    ) -> Result<(), RestError>;

    /// Download up to `len` bytes starting at `offset`
    ///
    /// An empty result means the offset is at or past the end of the
    /// content.
    async fn download_chunk(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
        server_uid: &ServerUid,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, RestError>;
}
