//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`ILocalFileSystem`] on top of `tokio::fs` for one sync root.
//!
//! ## Design Decisions
//!
//! - **Staged downloads**: content is appended to `<name>.boxsync-partial`
//!   next to the target and renamed into place once complete, so a crash
//!   never leaves a truncated file at the real path.
//! - **MD5 digests**: the server identifies content by MD5, so local and
//!   remote content can be compared without transferring it.
//! - **Blocking work** (hashing, tree walks) runs on `spawn_blocking`.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use boxsync_core::domain::newtypes::{Digest128, RelativePath, SyncPath};
use boxsync_core::ports::{FileSystemState, ILocalFileSystem};

/// Suffix of staged download files
pub const PARTIAL_SUFFIX: &str = ".boxsync-partial";

/// Read buffer used while hashing
const HASH_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// LocalFileSystemAdapter struct
// ============================================================================

/// Adapter that bridges the [`ILocalFileSystem`] port to the real filesystem
#[derive(Debug, Clone)]
pub struct LocalFileSystemAdapter {
    root: SyncPath,
}

impl LocalFileSystemAdapter {
    #[must_use]
    pub fn new(root: SyncPath) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &SyncPath {
        &self.root
    }

    fn absolute(&self, path: &RelativePath) -> PathBuf {
        self.root.resolve(path)
    }

    fn partial(&self, path: &RelativePath) -> PathBuf {
        let mut p = self.absolute(path).into_os_string();
        p.push(PARTIAL_SUFFIX);
        PathBuf::from(p)
    }
}

fn to_utc(time: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

fn state_from_metadata(metadata: &std::fs::Metadata) -> FileSystemState {
    let is_file = metadata.is_file();
    FileSystemState {
        exists: true,
        is_file,
        size: if is_file { metadata.len() } else { 0 },
        modified: to_utc(metadata.modified()),
        created: to_utc(metadata.created()),
    }
}

/// MD5 of a file, streamed
fn md5_file(path: &Path) -> anyhow::Result<Digest128> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest128::from_bytes(hasher.finalize().into()))
}

/// MD5 of an in-memory buffer
#[must_use]
pub fn md5_bytes(data: &[u8]) -> Digest128 {
    Digest128::from_bytes(Md5::digest(data).into())
}

// ============================================================================
// ILocalFileSystem implementation
// ============================================================================

#[async_trait::async_trait]
impl ILocalFileSystem for LocalFileSystemAdapter {
    #[instrument(skip(self), fields(path = %path))]
    async fn get_state(&self, path: &RelativePath) -> anyhow::Result<FileSystemState> {
        match tokio::fs::metadata(self.absolute(path)).await {
            Ok(metadata) => Ok(state_from_metadata(&metadata)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("path not found");
                Ok(FileSystemState::not_found())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn compute_hash(&self, path: &RelativePath) -> anyhow::Result<Digest128> {
        let abs = self.absolute(path);
        let digest = tokio::task::spawn_blocking(move || md5_file(&abs)).await??;
        debug!(hash = %digest, "hash computed");
        Ok(digest)
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn read_chunk(
        &self,
        path: &RelativePath,
        offset: u64,
        len: usize,
    ) -> anyhow::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(self.absolute(path))
            .await
            .with_context(|| format!("Failed to open {path}"))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    #[instrument(skip(self, data), fields(path = %path, bytes = data.len()))]
    async fn write_partial(
        &self,
        path: &RelativePath,
        offset: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let partial = self.partial(path);

        let mut file = if offset == 0 {
            if let Some(parent) = partial.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::File::create(&partial).await?
        } else {
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await
                .with_context(|| format!("No partial download for {path}"))?;
            let len = file.metadata().await?.len();
            if len != offset {
                bail!("Partial download for {path} has {len} bytes, expected {offset}");
            }
            file
        };

        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn finish_partial(&self, path: &RelativePath) -> anyhow::Result<Digest128> {
        let partial = self.partial(path);
        let target = self.absolute(path);

        let hash_path = partial.clone();
        let digest = tokio::task::spawn_blocking(move || md5_file(&hash_path)).await??;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!("renaming partial file into place");
        tokio::fs::rename(&partial, &target)
            .await
            .with_context(|| format!("Failed to move download into place at {path}"))?;
        Ok(digest)
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn discard_partial(&self, path: &RelativePath) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.partial(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn create_directory(&self, path: &RelativePath) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.absolute(path)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn remove(&self, path: &RelativePath) -> anyhow::Result<()> {
        let p = self.absolute(path);
        let metadata = match tokio::fs::symlink_metadata(&p).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            debug!("removing directory recursively");
            tokio::fs::remove_dir_all(&p).await?;
        } else {
            tokio::fs::remove_file(&p).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn rename(&self, from: &RelativePath, to: &RelativePath) -> anyhow::Result<()> {
        let target = self.absolute(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.absolute(from), &target)
            .await
            .with_context(|| format!("Failed to rename {from} to {to}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn walk(&self) -> anyhow::Result<Vec<(RelativePath, FileSystemState)>> {
        let root = self.root.clone();
        let entries = tokio::task::spawn_blocking(move || walk_tree(&root)).await??;
        debug!(count = entries.len(), "walked sync root");
        Ok(entries)
    }
}

/// Depth-first walk, parents before children, siblings sorted by name.
/// Symlinks and partial downloads are skipped.
fn walk_tree(root: &SyncPath) -> anyhow::Result<Vec<(RelativePath, FileSystemState)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.as_path().to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut children: Vec<_> = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .collect();
        children.sort();

        let mut subdirs = Vec::new();
        for child in children {
            let Ok(metadata) = std::fs::symlink_metadata(&child) else {
                continue;
            };
            if metadata.file_type().is_symlink() {
                continue;
            }
            if child
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
            {
                continue;
            }
            let Ok(rel) = root.relativize(&child) else {
                debug!(path = %child.display(), "skipping unrepresentable path");
                continue;
            };
            if metadata.is_dir() {
                subdirs.push(child);
            }
            out.push((rel, state_from_metadata(&metadata)));
        }
        // Reverse so the stack pops them in sorted order
        stack.extend(subdirs.into_iter().rev());
    }

    Ok(out)
}

// ============================================================================
// Unit tests
// ============================================================================
