//! ChangeModel domain type
//!
//! A [`ChangeModel`] describes a single filesystem mutation, either observed
//! locally (`ToServer`) or synthesized from the server change list
//! (`FromServer`). The same type flows through the whole pipeline; the
//! direction decides whether executing it means a network call or a local
//! filesystem mutation.
//!
//! ```text
//!   local fs ──► Debouncer ──► ChangeModel(ToServer)   ──► REST one-off op
//!   server   ──► change list ─► ChangeModel(FromServer) ──► local fs op
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{Digest128, RelativePath, ServerUid};

// ============================================================================
// ChangeKind / Direction
// ============================================================================

/// The kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed => "renamed",
        };
        f.write_str(s)
    }
}

/// Which side must be brought in line with the other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A local mutation to replay on the server
    ToServer,
    /// A server mutation to replay on the local filesystem
    FromServer,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToServer => f.write_str("to_server"),
            Direction::FromServer => f.write_str("from_server"),
        }
    }
}

// ============================================================================
// ChangeModel
// ============================================================================

/// Typed description of one filesystem mutation plus its metadata
///
/// For `Renamed`, `old_path` is the source and `new_path` the destination.
/// For `Deleted`, the deleted item is named by `old_path`. For `Created` and
/// `Modified`, the item is named by `new_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeModel {
    pub kind: ChangeKind,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<RelativePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_path: Option<RelativePath>,
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Digest128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_uid: Option<ServerUid>,
}

impl ChangeModel {
    fn empty(kind: ChangeKind, direction: Direction, is_folder: bool) -> Self {
        Self {
            kind,
            direction,
            old_path: None,
            new_path: None,
            is_folder,
            size: None,
            hash: None,
            created_at: None,
            modified_at: None,
            revision: None,
            server_uid: None,
        }
    }

    /// A new item appeared at `path`
    #[must_use]
    pub fn created(direction: Direction, path: RelativePath, is_folder: bool) -> Self {
        let mut change = Self::empty(ChangeKind::Created, direction, is_folder);
        change.new_path = Some(path);
        change
    }

    /// The content of the file at `path` changed
    #[must_use]
    pub fn modified(direction: Direction, path: RelativePath) -> Self {
        let mut change = Self::empty(ChangeKind::Modified, direction, false);
        change.new_path = Some(path);
        change
    }

    /// The item at `path` was removed
    #[must_use]
    pub fn deleted(direction: Direction, path: RelativePath, is_folder: bool) -> Self {
        let mut change = Self::empty(ChangeKind::Deleted, direction, is_folder);
        change.old_path = Some(path);
        change
    }

    /// The item at `from` now lives at `to`
    #[must_use]
    pub fn renamed(
        direction: Direction,
        from: RelativePath,
        to: RelativePath,
        is_folder: bool,
    ) -> Self {
        let mut change = Self::empty(ChangeKind::Renamed, direction, is_folder);
        change.old_path = Some(from);
        change.new_path = Some(to);
        change
    }

    #[must_use]
    pub fn with_hash(mut self, hash: Digest128) -> Self {
        self.hash = Some(hash);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    #[must_use]
    pub fn with_server_uid(mut self, uid: ServerUid) -> Self {
        self.server_uid = Some(uid);
        self
    }

    #[must_use]
    pub fn with_timestamps(
        mut self,
        created_at: Option<DateTime<Utc>>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self
    }

    /// The path this change applies to: the destination when there is one,
    /// otherwise the source.
    #[must_use]
    pub fn primary_path(&self) -> Option<&RelativePath> {
        self.new_path.as_ref().or(self.old_path.as_ref())
    }

    /// Every path this change touches (source and destination)
    pub fn touched_paths(&self) -> impl Iterator<Item = &RelativePath> {
        self.old_path.iter().chain(self.new_path.iter())
    }

    /// Check the structural invariants of this change
    ///
    /// # Errors
    /// Returns `DomainError::MalformedChange` when:
    /// - a `Modified` change is marked as a folder
    /// - a `Created`/`Modified`/`Renamed` change toward the server names
    ///   neither a destination path nor a server uid
    /// - a `Renamed` change has no source path, or neither a destination
    ///   path nor a server uid
    /// - a `Deleted` change names neither a path nor a server uid
    /// - a `Renamed` change has identical source and destination
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.kind == ChangeKind::Modified && self.is_folder {
            return Err(DomainError::MalformedChange(
                "a modified change cannot describe a folder".to_string(),
            ));
        }

        let has_target = self.new_path.is_some() || self.server_uid.is_some();

        if self.direction == Direction::ToServer
            && matches!(
                self.kind,
                ChangeKind::Created | ChangeKind::Modified | ChangeKind::Renamed
            )
            && !has_target
        {
            return Err(DomainError::MalformedChange(format!(
                "{} change toward the server needs a new path or a server uid",
                self.kind
            )));
        }

        match self.kind {
            ChangeKind::Renamed => {
                if self.old_path.is_none() || !has_target {
                    return Err(DomainError::MalformedChange(
                        "a rename needs an old path and a new path or server uid".to_string(),
                    ));
                }
                if self.old_path == self.new_path {
                    return Err(DomainError::MalformedChange(
                        "a rename must change the path".to_string(),
                    ));
                }
            }
            ChangeKind::Deleted => {
                if self.old_path.is_none() && self.server_uid.is_none() {
                    return Err(DomainError::MalformedChange(
                        "a delete needs a path or a server uid".to_string(),
                    ));
                }
            }
            ChangeKind::Created | ChangeKind::Modified => {
                if self.direction == Direction::FromServer && self.new_path.is_none() {
                    return Err(DomainError::MalformedChange(format!(
                        "{} change from the server needs a path",
                        self.kind
                    )));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for ChangeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.old_path, &self.new_path) {
            (ChangeKind::Renamed, Some(old), Some(new)) => {
                write!(f, "{} {} {old} -> {new}", self.direction, self.kind)
            }
            (_, _, _) => match self.primary_path() {
                Some(p) => write!(f, "{} {} {p}", self.direction, self.kind),
                None => write!(f, "{} {} <no path>", self.direction, self.kind),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
