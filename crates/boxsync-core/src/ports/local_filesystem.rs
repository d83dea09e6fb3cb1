//! Local filesystem port (driven/secondary port)
//!
//! This module defines the interface for the local side of the sync root:
//! stat, hashing, chunked reads, staged downloads, and tree mutations.
//! All paths are relative to the sync root the adapter was built for.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because filesystem errors are adapter-specific.
//! - Downloads are staged in a partial file next to the target and only
//!   moved into place by [`ILocalFileSystem::finish_partial`], so a crash
//!   never leaves a truncated file at the real path.
//! - Watching is not part of this port; the watcher feeds raw events
//!   directly to the debouncer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::newtypes::{Digest128, RelativePath};

// ============================================================================
// FileSystemState struct
// ============================================================================

/// Snapshot of a path's state on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemState {
    /// Whether the file/directory exists on disk
    pub exists: bool,
    /// Whether this is a regular file (false for directories)
    pub is_file: bool,
    /// Size in bytes (0 for directories or non-existent files)
    pub size: u64,
    /// Last modification time
    pub modified: Option<DateTime<Utc>>,
    /// Creation time, where the platform records one
    pub created: Option<DateTime<Utc>>,
}

impl FileSystemState {
    /// Returns a state representing a non-existent path
    #[must_use]
    pub fn not_found() -> Self {
        Self {
            exists: false,
            is_file: false,
            size: 0,
            modified: None,
            created: None,
        }
    }

    /// Returns true if the path exists and is a regular file
    #[must_use]
    pub fn is_regular_file(&self) -> bool {
        self.exists && self.is_file
    }

    /// Returns true if the path exists and is a directory
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.exists && !self.is_file
    }
}

// ============================================================================
// ILocalFileSystem trait
// ============================================================================

/// Port for filesystem operations inside the sync root
#[async_trait]
pub trait ILocalFileSystem: Send + Sync {
    /// Stat a path; a missing path is `FileSystemState::not_found()`
    async fn get_state(&self, path: &RelativePath) -> anyhow::Result<FileSystemState>;

    /// Digest of the file content
    async fn compute_hash(&self, path: &RelativePath) -> anyhow::Result<Digest128>;

    /// Read up to `len` bytes at `offset`
    async fn read_chunk(&self, path: &RelativePath, offset: u64, len: usize)
        -> anyhow::Result<Vec<u8>>;

    /// Append bytes to the partial download for `path`, creating it when
    /// `offset` is 0
    async fn write_partial(&self, path: &RelativePath, offset: u64, data: &[u8])
        -> anyhow::Result<()>;

    /// Atomically move the partial download into place and return the
    /// digest of what was written
    async fn finish_partial(&self, path: &RelativePath) -> anyhow::Result<Digest128>;

    /// Remove a partial download, if any
    async fn discard_partial(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Create a directory and its parents
    async fn create_directory(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Remove a file, or a directory recursively; missing paths are fine
    async fn remove(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Rename within the root, creating the destination's parents
    async fn rename(&self, from: &RelativePath, to: &RelativePath) -> anyhow::Result<()>;

    /// Every file and directory below the root, parents before children
    async fn walk(&self) -> anyhow::Result<Vec<(RelativePath, FileSystemState)>>;
}
