//! Wire types for the sync REST API
//!
//! The server speaks JSON with snake_case keys and absolute, `/`-rooted
//! paths. These types are private to the adapter; everything leaving this
//! crate is converted into `boxsync-core` domain types first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxsync_core::domain::newtypes::{Cursor, Digest128, RelativePath, ServerUid};
use boxsync_core::ports::{ChangePage, FileMetadata, QuotaReading, RestError, ServerItem};

// ============================================================================
// Path conversion
// ============================================================================

/// `a/b.txt` -> `/a/b.txt`
pub(crate) fn to_wire_path(path: &RelativePath) -> String {
    format!("/{}", path.as_str())
}

/// `/a/b.txt` -> `a/b.txt`
pub(crate) fn from_wire_path(path: &str) -> Result<RelativePath, RestError> {
    RelativePath::new(path.trim_start_matches('/').to_string())
        .map_err(|e| RestError::InvalidResponse(format!("bad path {path:?}: {e}")))
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct FileAddBody {
    pub path: String,
    pub hash: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileAddBody {
    pub(crate) fn new(path: &RelativePath, metadata: &FileMetadata) -> Self {
        Self {
            path: to_wire_path(path),
            hash: metadata.hash.to_hex(),
            size: metadata.size,
            created_at: metadata.created_at,
            modified_at: metadata.modified_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct FolderAddBody {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct FileModifyBody {
    pub uid: String,
    pub path: String,
    pub hash: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeleteBody {
    pub uid: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MoveBody {
    pub uid: String,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

// ============================================================================
// Response bodies
// ============================================================================

/// One item as the server describes it
#[derive(Debug, Deserialize)]
pub(crate) struct ItemDto {
    pub uid: String,
    pub path: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
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
    #[serde(default)]
    pub content_required: bool,
}

impl TryFrom<ItemDto> for ServerItem {
    type Error = RestError;

    fn try_from(dto: ItemDto) -> Result<Self, Self::Error> {
        let uid = ServerUid::new(dto.uid)
            .map_err(|e| RestError::InvalidResponse(format!("bad uid: {e}")))?;
        let hash = match dto.hash.as_deref() {
            Some(h) if !h.is_empty() => Some(
                Digest128::from_hex(h)
                    .map_err(|e| RestError::InvalidResponse(format!("bad hash: {e}")))?,
            ),
            _ => None,
        };

        Ok(ServerItem {
            uid,
            path: from_wire_path(&dto.path)?,
            revision: dto.revision,
            hash,
            size: dto.size,
            is_folder: dto.is_folder,
            is_deleted: dto.is_deleted,
            created_at: dto.created_at,
            modified_at: dto.modified_at,
            content_required: dto.content_required,
        })
    }
}

/// One page of `GET /1/sync/changes`
#[derive(Debug, Deserialize)]
pub(crate) struct ChangesDto {
    #[serde(default)]
    pub items: Vec<ItemDto>,
    pub cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

impl TryFrom<ChangesDto> for ChangePage {
    type Error = RestError;

    fn try_from(dto: ChangesDto) -> Result<Self, Self::Error> {
        let items = dto
            .items
            .into_iter()
            .map(ServerItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let cursor = Cursor::new(dto.cursor)
            .map_err(|e| RestError::InvalidResponse(format!("bad cursor: {e}")))?;

        Ok(ChangePage {
            items,
            cursor,
            has_more: dto.has_more,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct QuotaDto {
    pub usage: u64,
    pub limit: u64,
}

impl From<QuotaDto> for QuotaReading {
    fn from(dto: QuotaDto) -> Self {
        QuotaReading {
            usage_bytes: dto.usage,
            limit_bytes: dto.limit,
        }
    }
}

/// Error body the server attaches to non-2xx responses
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub current_revision: Option<String>,
}

/// One message of the long-poll notification endpoint
#[derive(Debug, Deserialize)]
pub(crate) struct NotificationDto {
    pub kind: String,
    #[serde(default)]
    pub origin_device: Option<String>,
}
