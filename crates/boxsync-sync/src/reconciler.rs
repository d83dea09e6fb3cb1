//! Reconciler - plans, executes and commits changes in both directions
//!
//! Every change, local or remote, follows the same pipeline:
//!
//! ```text
//!  ChangeModel ──► validate ──► record_event ──► supersede ──► submit
//!                                                                │
//!          ┌─────────────────────────────────────────────────────┘
//!          ▼            (under the per-path locks)
//!       prepare: ChangeModel + IndexEntry + local stat ──► Action
//!          │
//!          ▼
//!        run: server call / transfer / local mutation ──► Applied
//!          │            │
//!          │            └─ conflict ──► re-fetch ──► last writer wins
//!          ▼
//!       commit: IndexCommit + event status, one transaction
//! ```
//!
//! Planning happens only once the task holds its path locks, so it always
//! sees the index as left by the previous change for the same path. That
//! also turns the watcher echoes of our own downloads into no-ops: by the
//! time they are planned the index already matches the disk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

use boxsync_core::config::Config;
use boxsync_core::domain::{
    newtypes::{Digest128, EventId, RelativePath, ServerUid},
    ChangeKind, ChangeModel, Direction, EngineEvent, EngineState, EventStatus, IndexCommit,
    IndexEntry, ItemOutcome, SyncStatus, TransferDirection, TransferStatus, TransferTask,
};
use boxsync_core::ports::{
    FileMetadata, FileSystemState, ILocalFileSystem, ILocalIndex, IRestClient, RequestContext,
    RestRequest, RestResponse, ServerItem, UploadChunk,
};

use crate::conflict::conflict_copy;
use crate::credentials::CredentialGuard;
use crate::filesystem::PARTIAL_SUFFIX;
use crate::notification::RemoteSignalSink;
use crate::quota::QuotaTracker;
use crate::scheduler::{
    SchedulerOptions, TaskControl, TransferExecutor, TransferResult, TransferScheduler,
};
use crate::{ConflictKind, SyncError};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Bytes per upload/download chunk
    pub chunk_size: usize,
    /// Move a losing local edit aside instead of overwriting it
    pub keep_local_copy: bool,
    /// File name suffixes never synced
    pub ignore_suffixes: Vec<String>,
}

impl ReconcilerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.transfers.chunk_size(),
            keep_local_copy: config.conflicts.keep_local_copy,
            ignore_suffixes: config.sync.ignore_suffixes.clone(),
        }
    }

    fn is_ignored(&self, path: &RelativePath) -> bool {
        let name = path.file_name();
        name.ends_with(PARTIAL_SUFFIX) || self.ignore_suffixes.iter().any(|s| name.ends_with(s))
    }
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ============================================================================
// Plans and results
// ============================================================================

/// What a prepared task is going to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The index already agrees with the change
    Skip,
    /// Index-only update, nothing to transfer
    Adopt(IndexCommit),
    CreateFile {
        path: RelativePath,
        metadata: FileMetadata,
    },
    CreateFolder {
        path: RelativePath,
    },
    ModifyFile {
        entry: IndexEntry,
        metadata: FileMetadata,
    },
    Delete {
        entry: IndexEntry,
    },
    /// Server-side move, replacing whatever was indexed at `to`; `content`
    /// is set when the file also changed
    Move {
        entry: IndexEntry,
        to: RelativePath,
        replaced: Option<IndexEntry>,
        content: Option<FileMetadata>,
    },
    /// Fetch `entry` from the server into its path
    Download {
        entry: IndexEntry,
        keep_local: bool,
    },
    LocalMkdir {
        entry: IndexEntry,
    },
    LocalDelete {
        entry: IndexEntry,
    },
    LocalRename {
        from: RelativePath,
        entry: IndexEntry,
        download: bool,
    },
}

impl Action {
    /// The path whose server state settles a conflict on this action
    fn subject(&self) -> Option<&RelativePath> {
        match self {
            Action::CreateFile { path, .. } | Action::CreateFolder { path } => Some(path),
            Action::ModifyFile { entry, .. }
            | Action::Delete { entry }
            | Action::Move { entry, .. }
            | Action::Download { entry, .. } => Some(&entry.path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    action: Action,
    /// Stable for the event, so a replayed create is recognised
    idempotency_key: String,
}

impl Plan {
    pub fn action(&self) -> &Action {
        &self.action
    }
}

/// Result of a successful attempt, waiting to be committed
#[derive(Debug)]
pub struct Applied {
    commit: IndexCommit,
    outcome: ItemOutcome,
    /// Changes to feed back into the pipeline after the commit
    followups: Vec<ChangeModel>,
}

impl Applied {
    fn committed(commit: IndexCommit) -> Self {
        Self {
            commit,
            outcome: ItemOutcome::Committed,
            followups: Vec::new(),
        }
    }

    fn skipped() -> Self {
        Self {
            commit: IndexCommit::Nothing,
            outcome: ItemOutcome::Skipped,
            followups: Vec::new(),
        }
    }
}

fn required<'a>(
    path: Option<&'a RelativePath>,
    which: &str,
) -> Result<&'a RelativePath, SyncError> {
    path.ok_or_else(|| SyncError::Structural(format!("change has no {which} path")))
}

/// Index entry described by a server-originated change
fn remote_entry(change: &ChangeModel, path: &RelativePath) -> Result<IndexEntry, SyncError> {
    let uid = change
        .server_uid
        .clone()
        .ok_or_else(|| SyncError::Structural("server change carries no server uid".into()))?;
    Ok(IndexEntry::new(
        path.clone(),
        uid,
        change.revision.clone(),
        change.hash,
        change.size.unwrap_or(0),
        change.is_folder,
    ))
}

fn server_entry(item: &ServerItem) -> IndexEntry {
    IndexEntry::new(
        item.path.clone(),
        item.uid.clone(),
        item.revision.clone(),
        item.hash,
        item.size,
        item.is_folder,
    )
}

/// Attach the server's view of an item to a synthesized change
fn describe(change: ChangeModel, item: &ServerItem) -> ChangeModel {
    let mut change = change
        .with_server_uid(item.uid.clone())
        .with_size(item.size)
        .with_timestamps(item.created_at, item.modified_at);
    if let Some(hash) = item.hash {
        change = change.with_hash(hash);
    }
    if let Some(revision) = &item.revision {
        change = change.with_revision(revision.clone());
    }
    change
}

/// Last writer wins: the local edit beats the server only when it is
/// strictly newer
fn local_is_newer(local: Option<DateTime<Utc>>, server: Option<DateTime<Utc>>) -> bool {
    matches!((local, server), (Some(l), Some(s)) if l > s)
}

fn local_metadata_of(local: &FileSystemState, hash: Digest128) -> FileMetadata {
    FileMetadata {
        hash,
        size: local.size,
        created_at: local.created,
        modified_at: local.modified,
    }
}

// ============================================================================
// PipelineExecutor
// ============================================================================

/// Ports the pipeline talks to
pub struct PipelineDeps {
    pub index: Arc<dyn ILocalIndex>,
    pub fs: Arc<dyn ILocalFileSystem>,
    pub rest: Arc<dyn IRestClient>,
    pub guard: CredentialGuard,
    pub ctx: RequestContext,
    pub events: broadcast::Sender<EngineEvent>,
    pub quota: Arc<QuotaTracker>,
}

/// The [`TransferExecutor`] behind every change
pub struct PipelineExecutor {
    index: Arc<dyn ILocalIndex>,
    fs: Arc<dyn ILocalFileSystem>,
    rest: Arc<dyn IRestClient>,
    guard: CredentialGuard,
    ctx: RequestContext,
    events: broadcast::Sender<EngineEvent>,
    quota: Arc<QuotaTracker>,
    followups: mpsc::UnboundedSender<ChangeModel>,
    options: ReconcilerOptions,
}

impl PipelineExecutor {
    /// Build the executor; the receiver yields follow-up changes (such as
    /// conflict copies) that must be fed back through the reconciler
    pub fn new(
        deps: PipelineDeps,
        options: ReconcilerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ChangeModel>) {
        let (followups, rx) = mpsc::unbounded_channel();
        (
            Self {
                index: deps.index,
                fs: deps.fs,
                rest: deps.rest,
                guard: deps.guard,
                ctx: deps.ctx,
                events: deps.events,
                quota: deps.quota,
                followups,
                options,
            },
            rx,
        )
    }

    pub fn index(&self) -> &Arc<dyn ILocalIndex> {
        &self.index
    }

    fn report(&self, event_id: EventId, path: Option<RelativePath>, outcome: ItemOutcome) {
        let _ = self.events.send(EngineEvent::ItemCompleted {
            event_id,
            path,
            outcome,
        });
    }

    // --- port helpers ---

    async fn stat(&self, path: &RelativePath) -> Result<FileSystemState, SyncError> {
        self.fs.get_state(path).await.map_err(SyncError::io)
    }

    async fn hash(&self, path: &RelativePath) -> Result<Digest128, SyncError> {
        self.fs.compute_hash(path).await.map_err(SyncError::io)
    }

    async fn local_metadata(
        &self,
        path: &RelativePath,
        local: &FileSystemState,
    ) -> Result<FileMetadata, SyncError> {
        Ok(local_metadata_of(local, self.hash(path).await?))
    }

    async fn entry(&self, path: &RelativePath) -> Result<Option<IndexEntry>, SyncError> {
        self.index.get_entry(path).await.map_err(SyncError::index)
    }

    async fn execute(&self, request: &RestRequest) -> Result<RestResponse, SyncError> {
        let rest = &self.rest;
        let ctx = &self.ctx;
        self.guard
            .with_credentials(|creds| async move { rest.execute(&creds, ctx, request).await })
            .await
    }

    async fn send_chunk(&self, chunk: &UploadChunk) -> Result<(), SyncError> {
        let rest = &self.rest;
        let ctx = &self.ctx;
        self.guard
            .with_credentials(|creds| async move { rest.upload_chunk(&creds, ctx, chunk).await })
            .await
    }

    async fn receive_chunk(
        &self,
        uid: &ServerUid,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, SyncError> {
        let rest = &self.rest;
        let ctx = &self.ctx;
        self.guard
            .with_credentials(|creds| async move {
                rest.download_chunk(&creds, ctx, uid, offset, len).await
            })
            .await
    }

    /// Current server metadata for a path, `None` when it does not exist
    async fn lookup(&self, path: &RelativePath) -> Result<Option<ServerItem>, SyncError> {
        match self
            .execute(&RestRequest::GetMetadata { path: path.clone() })
            .await
        {
            Ok(response) => {
                let item = response.into_item()?;
                Ok((!item.is_deleted).then_some(item))
            }
            Err(SyncError::Conflict {
                kind: ConflictKind::NotFound,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Derive the action for a change from the index and the local disk
    ///
    /// # Errors
    /// `SyncError::Structural` for changes that cannot be applied, or the
    /// index/filesystem error that prevented planning
    #[instrument(skip(self, change), fields(kind = %change.kind, direction = %change.direction))]
    pub async fn plan(&self, event_id: EventId, change: &ChangeModel) -> Result<Plan, SyncError> {
        let action = match change.direction {
            Direction::ToServer => self.plan_outgoing(change).await?,
            Direction::FromServer => self.plan_incoming(change).await?,
        };
        debug!(event_id = %event_id, ?action, "Planned change");
        Ok(Plan {
            action,
            idempotency_key: format!("{}-{}", self.ctx.device_id, event_id),
        })
    }

    async fn plan_outgoing(&self, change: &ChangeModel) -> Result<Action, SyncError> {
        match change.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                self.plan_upload(required(change.new_path.as_ref(), "new")?)
                    .await
            }
            ChangeKind::Deleted => {
                let path = required(change.old_path.as_ref(), "old")?;
                if self.stat(path).await?.exists {
                    // Re-created since; the newer change covers it
                    return Ok(Action::Skip);
                }
                Ok(match self.entry(path).await? {
                    Some(entry) => Action::Delete { entry },
                    None => Action::Skip,
                })
            }
            ChangeKind::Renamed => {
                let from = required(change.old_path.as_ref(), "old")?;
                let to = required(change.new_path.as_ref(), "new")?;
                self.plan_rename(from, to).await
            }
        }
    }

    async fn plan_upload(&self, path: &RelativePath) -> Result<Action, SyncError> {
        let local = self.stat(path).await?;
        if !local.exists {
            return Ok(Action::Skip);
        }
        let entry = self.entry(path).await?;

        if local.is_directory() {
            return Ok(match entry {
                Some(e) if e.is_folder => Action::Skip,
                _ => Action::CreateFolder { path: path.clone() },
            });
        }

        let metadata = self.local_metadata(path, &local).await?;
        Ok(match entry {
            Some(e) if e.content_matches(Some(&metadata.hash), metadata.size) => Action::Skip,
            Some(e) if !e.is_folder => Action::ModifyFile { entry: e, metadata },
            _ => Action::CreateFile {
                path: path.clone(),
                metadata,
            },
        })
    }

    async fn plan_rename(&self, from: &RelativePath, to: &RelativePath) -> Result<Action, SyncError> {
        let target = self.stat(to).await?;
        let source_left = self.stat(from).await?.exists;
        let source = self.entry(from).await?;
        let existing = self.entry(to).await?;

        if !target.exists {
            // Moved on again or removed since
            return Ok(match source {
                Some(entry) if !source_left => Action::Delete { entry },
                _ => Action::Skip,
            });
        }

        if let Some(current) = &existing {
            if self.already_indexed(to, &target, current).await? {
                return Ok(match source {
                    Some(entry) if !source_left && entry.server_uid != current.server_uid => {
                        Action::Delete { entry }
                    }
                    _ => Action::Skip,
                });
            }
        }

        match source {
            Some(entry) if !source_left && entry.is_folder == target.is_directory() => {
                let content = if entry.is_folder {
                    None
                } else {
                    let metadata = self.local_metadata(to, &target).await?;
                    (!entry.content_matches(Some(&metadata.hash), metadata.size))
                        .then_some(metadata)
                };
                Ok(Action::Move {
                    entry,
                    to: to.clone(),
                    replaced: existing,
                    content,
                })
            }
            _ => self.plan_upload(to).await,
        }
    }

    async fn already_indexed(
        &self,
        path: &RelativePath,
        local: &FileSystemState,
        entry: &IndexEntry,
    ) -> Result<bool, SyncError> {
        if entry.is_folder || local.is_directory() {
            return Ok(entry.is_folder == local.is_directory());
        }
        let hash = self.hash(path).await?;
        Ok(entry.content_matches(Some(&hash), local.size))
    }

    async fn plan_incoming(&self, change: &ChangeModel) -> Result<Action, SyncError> {
        match change.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                let path = required(change.new_path.as_ref(), "new")?;
                self.plan_download(remote_entry(change, path)?, change.modified_at)
                    .await
            }
            ChangeKind::Deleted => {
                let path = required(change.old_path.as_ref(), "old")?;
                self.plan_local_delete(path, change.server_uid.as_ref())
                    .await
            }
            ChangeKind::Renamed => {
                let from = required(change.old_path.as_ref(), "old")?;
                let to = required(change.new_path.as_ref(), "new")?;
                self.plan_local_rename(from, remote_entry(change, to)?, change.modified_at)
                    .await
            }
        }
    }

    async fn plan_download(
        &self,
        incoming: IndexEntry,
        server_time: Option<DateTime<Utc>>,
    ) -> Result<Action, SyncError> {
        let local = self.stat(&incoming.path).await?;

        if incoming.is_folder {
            return match (local.exists, local.is_directory()) {
                (false, _) => Ok(Action::LocalMkdir { entry: incoming }),
                (true, true) => Ok(Action::Adopt(IndexCommit::Upsert(incoming))),
                (true, false) => Err(SyncError::Structural(format!(
                    "{} is a file locally but a folder on the server",
                    incoming.path
                ))),
            };
        }
        if !local.exists {
            return Ok(Action::Download {
                entry: incoming,
                keep_local: false,
            });
        }
        if local.is_directory() {
            return Err(SyncError::Structural(format!(
                "{} is a folder locally but a file on the server",
                incoming.path
            )));
        }

        let hash = self.hash(&incoming.path).await?;
        if incoming.hash == Some(hash) {
            return Ok(Action::Adopt(IndexCommit::Upsert(incoming)));
        }
        let unchanged_locally = self
            .entry(&incoming.path)
            .await?
            .is_some_and(|e| e.content_matches(Some(&hash), local.size));
        if unchanged_locally {
            return Ok(Action::Download {
                entry: incoming,
                keep_local: false,
            });
        }

        // Both sides changed since the last sync
        if local_is_newer(local.modified, server_time) {
            info!(path = %incoming.path, "Local edit is newer than the server's");
            Ok(Action::ModifyFile {
                entry: incoming,
                metadata: local_metadata_of(&local, hash),
            })
        } else {
            info!(path = %incoming.path, "Server edit is newer than the local one");
            Ok(Action::Download {
                entry: incoming,
                keep_local: self.options.keep_local_copy,
            })
        }
    }

    async fn plan_local_delete(
        &self,
        path: &RelativePath,
        uid: Option<&ServerUid>,
    ) -> Result<Action, SyncError> {
        let Some(entry) = self.entry(path).await? else {
            return Ok(Action::Skip);
        };
        if uid.is_some_and(|uid| *uid != entry.server_uid) {
            debug!(path = %path, "Deleted item no longer lives at this path");
            return Ok(Action::Skip);
        }
        let local = self.stat(path).await?;

        if !local.exists || local.is_directory() != entry.is_folder {
            return Ok(Action::Adopt(IndexCommit::Remove {
                path: path.clone(),
                recursive: entry.is_folder,
            }));
        }
        if entry.is_folder {
            return Ok(Action::LocalDelete { entry });
        }

        let metadata = self.local_metadata(path, &local).await?;
        if entry.content_matches(Some(&metadata.hash), metadata.size) {
            Ok(Action::LocalDelete { entry })
        } else {
            info!(path = %path, "Deleted on the server but edited locally, keeping the edit");
            Ok(Action::CreateFile {
                path: path.clone(),
                metadata,
            })
        }
    }

    async fn plan_local_rename(
        &self,
        from: &RelativePath,
        incoming: IndexEntry,
        server_time: Option<DateTime<Utc>>,
    ) -> Result<Action, SyncError> {
        let known = self
            .entry(from)
            .await?
            .filter(|known| known.server_uid == incoming.server_uid);
        let Some(known) = known else {
            return self.plan_download(incoming, server_time).await;
        };
        let source_left = self.stat(from).await?.exists;
        let target = self.stat(&incoming.path).await?;

        let download = if incoming.is_folder {
            false
        } else if source_left && !target.exists {
            !known.content_matches(incoming.hash.as_ref(), incoming.size)
        } else if target.is_regular_file() {
            Some(self.hash(&incoming.path).await?) != incoming.hash
        } else {
            !target.exists
        };

        Ok(Action::LocalRename {
            from: from.clone(),
            entry: incoming,
            download,
        })
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn apply(&self, plan: &Plan, ctl: &TaskControl) -> Result<Applied, SyncError> {
        ctl.reset_progress();
        let key = plan.idempotency_key.as_str();

        let result = match &plan.action {
            Action::Skip => Ok(Applied::skipped()),
            Action::Adopt(commit) => Ok(Applied::committed(commit.clone())),
            Action::CreateFile { path, metadata } => self
                .create_file(path, metadata, key, ctl)
                .await
                .map(|e| Applied::committed(IndexCommit::Upsert(e))),
            Action::CreateFolder { path } => self
                .create_folder(path, key, ctl)
                .await
                .map(|e| Applied::committed(IndexCommit::Upsert(e))),
            Action::ModifyFile { entry, metadata } => self
                .modify_file(entry, metadata, ctl)
                .await
                .map(|e| Applied::committed(IndexCommit::Upsert(e))),
            Action::Delete { entry } => self.delete_remote(entry, ctl).await,
            Action::Move {
                entry,
                to,
                replaced,
                content,
            } => {
                self.move_remote(entry, to, replaced.as_ref(), content.as_ref(), ctl)
                    .await
            }
            Action::Download { entry, keep_local } => {
                self.download_file(entry, *keep_local, ctl).await
            }
            Action::LocalMkdir { entry } => {
                self.fs
                    .create_directory(&entry.path)
                    .await
                    .map_err(SyncError::io)?;
                Ok(Applied::committed(IndexCommit::Upsert(entry.clone())))
            }
            Action::LocalDelete { entry } => {
                self.fs.remove(&entry.path).await.map_err(SyncError::io)?;
                Ok(Applied::committed(IndexCommit::Remove {
                    path: entry.path.clone(),
                    recursive: entry.is_folder,
                }))
            }
            Action::LocalRename {
                from,
                entry,
                download,
            } => self.rename_local(from, entry, *download, ctl).await,
        };

        match result {
            Err(SyncError::Conflict { kind, message }) => {
                warn!(action = ?plan.action, ?kind, message = %message, "Server reported a conflict");
                self.resolve_conflict(plan, ctl).await
            }
            other => other,
        }
    }

    async fn create_file(
        &self,
        path: &RelativePath,
        metadata: &FileMetadata,
        key: &str,
        ctl: &TaskControl,
    ) -> Result<IndexEntry, SyncError> {
        let request = RestRequest::CreateFile {
            path: path.clone(),
            metadata: metadata.clone(),
            idempotency_key: key.to_string(),
        };
        let item = ctl.call(self.execute(&request)).await?.into_item()?;
        if item.content_required {
            self.upload_content(&item.uid, path, metadata.size, ctl)
                .await?;
        }
        Ok(uploaded_entry(path, &item, metadata))
    }

    async fn create_folder(
        &self,
        path: &RelativePath,
        key: &str,
        ctl: &TaskControl,
    ) -> Result<IndexEntry, SyncError> {
        let request = RestRequest::CreateFolder {
            path: path.clone(),
            idempotency_key: key.to_string(),
        };
        let item = ctl.call(self.execute(&request)).await?.into_item()?;
        Ok(IndexEntry::new(
            path.clone(),
            item.uid,
            item.revision,
            None,
            0,
            true,
        ))
    }

    async fn modify_file(
        &self,
        entry: &IndexEntry,
        metadata: &FileMetadata,
        ctl: &TaskControl,
    ) -> Result<IndexEntry, SyncError> {
        let request = RestRequest::ModifyFile {
            server_uid: entry.server_uid.clone(),
            path: entry.path.clone(),
            metadata: metadata.clone(),
            revision: entry.revision.clone(),
        };
        let item = ctl.call(self.execute(&request)).await?.into_item()?;
        if item.content_required {
            self.upload_content(&item.uid, &entry.path, metadata.size, ctl)
                .await?;
        }
        Ok(uploaded_entry(&entry.path, &item, metadata))
    }

    async fn delete_remote(
        &self,
        entry: &IndexEntry,
        ctl: &TaskControl,
    ) -> Result<Applied, SyncError> {
        let request = RestRequest::Delete {
            server_uid: entry.server_uid.clone(),
            path: entry.path.clone(),
            is_folder: entry.is_folder,
            revision: entry.revision.clone(),
        };
        ctl.call(self.execute(&request)).await?;
        Ok(Applied::committed(IndexCommit::Remove {
            path: entry.path.clone(),
            recursive: entry.is_folder,
        }))
    }

    async fn move_remote(
        &self,
        entry: &IndexEntry,
        to: &RelativePath,
        replaced: Option<&IndexEntry>,
        content: Option<&FileMetadata>,
        ctl: &TaskControl,
    ) -> Result<Applied, SyncError> {
        if let Some(old) = replaced.filter(|old| old.server_uid != entry.server_uid) {
            match self.delete_remote(old, ctl).await {
                Ok(_)
                | Err(SyncError::Conflict {
                    kind: ConflictKind::NotFound,
                    ..
                }) => {}
                Err(e) => return Err(e),
            }
        }

        let request = RestRequest::Move {
            server_uid: entry.server_uid.clone(),
            from: entry.path.clone(),
            to: to.clone(),
            is_folder: entry.is_folder,
            revision: entry.revision.clone(),
        };
        let item = ctl.call(self.execute(&request)).await?.into_item()?;
        let mut moved = IndexEntry::new(
            to.clone(),
            item.uid,
            item.revision,
            entry.hash,
            entry.size,
            entry.is_folder,
        );
        if let Some(metadata) = content {
            moved = self.modify_file(&moved, metadata, ctl).await?;
        }

        Ok(Applied::committed(IndexCommit::Move {
            from: entry.path.clone(),
            to: to.clone(),
            entry: moved,
        }))
    }

    async fn upload_content(
        &self,
        uid: &ServerUid,
        path: &RelativePath,
        size: u64,
        ctl: &TaskControl,
    ) -> Result<(), SyncError> {
        ctl.set_total(size);
        let mut offset = 0u64;

        // At least one chunk, so an empty file is completed too
        loop {
            ctl.checkpoint()?;
            let data = self
                .fs
                .read_chunk(path, offset, self.options.chunk_size)
                .await
                .map_err(SyncError::io)?;
            if data.is_empty() && offset < size {
                return Err(SyncError::Io(format!("{path} shrank while uploading")));
            }

            let len = data.len() as u64;
            let chunk = UploadChunk {
                server_uid: uid.clone(),
                offset,
                total_size: size,
                data,
            };
            ctl.call(self.send_chunk(&chunk)).await?;
            offset += len;
            ctl.advance(len);

            if offset >= size {
                break;
            }
        }
        debug!(path = %path, bytes = offset, "Content uploaded");
        Ok(())
    }

    /// Stream the server content of `entry` into its partial file
    async fn fetch_partial(&self, entry: &IndexEntry, ctl: &TaskControl) -> Result<(), SyncError> {
        let path = &entry.path;
        let size = entry.size;
        ctl.set_total(size);

        self.fs
            .write_partial(path, 0, &[])
            .await
            .map_err(SyncError::io)?;
        let mut offset = 0u64;
        while offset < size {
            ctl.checkpoint()?;
            let len = (size - offset).min(self.options.chunk_size as u64);
            let data = ctl
                .call(self.receive_chunk(&entry.server_uid, offset, len))
                .await?;
            if data.is_empty() {
                return Err(SyncError::transport(format!(
                    "download of {path} ended at {offset} of {size} bytes"
                )));
            }
            self.fs
                .write_partial(path, offset, &data)
                .await
                .map_err(SyncError::io)?;
            offset += data.len() as u64;
            ctl.advance(data.len() as u64);
        }
        Ok(())
    }

    /// Download `entry`, optionally moving the local file aside first
    async fn download_file(
        &self,
        entry: &IndexEntry,
        keep_local: bool,
        ctl: &TaskControl,
    ) -> Result<Applied, SyncError> {
        let path = &entry.path;
        self.fetch_partial(entry, ctl).await?;

        let mut followups = Vec::new();
        if keep_local && self.stat(path).await?.is_regular_file() {
            ctl.seal()?;
            let copy = self.conflict_copy_path(path).await?;
            self.fs.rename(path, &copy).await.map_err(SyncError::io)?;
            info!(path = %path, copy = %copy, "Kept the local version as a conflict copy");
            followups.push(ChangeModel::created(Direction::ToServer, copy, false));
        }

        let digest = self.fs.finish_partial(path).await.map_err(SyncError::io)?;
        if entry.hash.is_some_and(|expected| expected != digest) {
            warn!(path = %path, "Downloaded content does not match the server digest");
        }

        Ok(Applied {
            commit: IndexCommit::Upsert(IndexEntry {
                hash: Some(digest),
                ..entry.clone()
            }),
            outcome: ItemOutcome::Committed,
            followups,
        })
    }

    async fn conflict_copy_path(&self, path: &RelativePath) -> Result<RelativePath, SyncError> {
        for _ in 0..8 {
            let candidate = conflict_copy(path, &self.ctx.device_id, Utc::now())?;
            if !self.stat(&candidate).await?.exists {
                return Ok(candidate);
            }
        }
        Err(SyncError::Io(format!("no free conflict copy name for {path}")))
    }

    async fn rename_local(
        &self,
        from: &RelativePath,
        entry: &IndexEntry,
        download: bool,
        ctl: &TaskControl,
    ) -> Result<Applied, SyncError> {
        let to = &entry.path;
        let source = self.stat(from).await?;
        let target = self.stat(to).await?;

        if source.exists && !target.exists {
            self.fs.rename(from, to).await.map_err(SyncError::io)?;
        } else if entry.is_folder && !target.exists {
            self.fs.create_directory(to).await.map_err(SyncError::io)?;
        }

        let moved = if download {
            match self.download_file(entry, false, ctl).await?.commit {
                IndexCommit::Upsert(stored) => stored,
                _ => entry.clone(),
            }
        } else {
            entry.clone()
        };

        Ok(Applied::committed(IndexCommit::Move {
            from: from.clone(),
            to: to.clone(),
            entry: moved,
        }))
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    /// Re-fetch the server state and settle the conflict
    ///
    /// Decides by last writer wins. The task is sealed first: from here on
    /// it may mutate local files, so it must not be superseded or retried.
    #[instrument(skip(self, plan, ctl), fields(event_id = %ctl.event_id()))]
    async fn resolve_conflict(&self, plan: &Plan, ctl: &TaskControl) -> Result<Applied, SyncError> {
        ctl.seal()?;
        let Some(path) = plan.action.subject() else {
            return Err(SyncError::Structural(format!(
                "unexpected conflict for {:?}",
                plan.action
            )));
        };
        let server = ctl.call(self.lookup(path)).await?;
        let key = plan.idempotency_key.as_str();

        match (&plan.action, server) {
            (Action::Delete { entry }, None) => Ok(Applied::committed(IndexCommit::Remove {
                path: entry.path.clone(),
                recursive: entry.is_folder,
            })),
            (Action::Delete { .. }, Some(item)) => {
                info!(path = %path, "Changed on the server after the local delete, restoring it");
                self.restore(&item, ctl).await
            }
            // Gone on the server; its deletion arrives with the change list
            (Action::Download { .. }, None) => Ok(Applied::skipped()),
            (Action::Download { keep_local, .. }, Some(item)) => {
                self.download_file(&server_entry(&item), *keep_local, ctl)
                    .await
            }
            (Action::Move { entry, to, .. }, None) => {
                let created = self.upload_current(to, key, ctl).await?;
                Ok(Applied::committed(match created {
                    Some(created) => IndexCommit::Move {
                        from: entry.path.clone(),
                        to: to.clone(),
                        entry: created,
                    },
                    None => IndexCommit::Remove {
                        path: entry.path.clone(),
                        recursive: entry.is_folder,
                    },
                }))
            }
            (
                Action::Move {
                    entry,
                    to,
                    replaced,
                    content,
                },
                Some(item),
            ) => {
                let current = IndexEntry {
                    server_uid: item.uid,
                    revision: item.revision,
                    ..entry.clone()
                };
                self.move_remote(&current, to, replaced.as_ref(), content.as_ref(), ctl)
                    .await
            }
            (_, None) => Ok(Applied::committed(
                match self.upload_current(path, key, ctl).await? {
                    Some(created) => IndexCommit::Upsert(created),
                    None => IndexCommit::Remove {
                        path: path.clone(),
                        recursive: false,
                    },
                },
            )),
            (_, Some(item)) => self.settle_content(path, item, ctl).await,
        }
    }

    /// Create whatever is on disk at `path` as a new server item
    async fn upload_current(
        &self,
        path: &RelativePath,
        key: &str,
        ctl: &TaskControl,
    ) -> Result<Option<IndexEntry>, SyncError> {
        let local = self.stat(path).await?;
        if local.is_directory() {
            return self.create_folder(path, key, ctl).await.map(Some);
        }
        if !local.exists {
            return Ok(None);
        }
        let metadata = self.local_metadata(path, &local).await?;
        self.create_file(path, &metadata, key, ctl).await.map(Some)
    }

    /// Bring a server item back onto the disk
    async fn restore(&self, item: &ServerItem, ctl: &TaskControl) -> Result<Applied, SyncError> {
        let entry = server_entry(item);
        if item.is_folder {
            self.fs
                .create_directory(&entry.path)
                .await
                .map_err(SyncError::io)?;
            return Ok(Applied::committed(IndexCommit::Upsert(entry)));
        }
        self.download_file(&entry, false, ctl).await
    }

    /// Both sides hold content for `path`: adopt, overwrite or download
    async fn settle_content(
        &self,
        path: &RelativePath,
        item: ServerItem,
        ctl: &TaskControl,
    ) -> Result<Applied, SyncError> {
        let local = self.stat(path).await?;
        let current = server_entry(&item);

        if item.is_folder && local.is_directory() {
            return Ok(Applied::committed(IndexCommit::Upsert(current)));
        }
        if item.is_folder || !local.is_regular_file() {
            if !local.exists {
                return self.restore(&item, ctl).await;
            }
            return Err(SyncError::Structural(format!(
                "{path} is a different kind of item on the server"
            )));
        }

        let metadata = self.local_metadata(path, &local).await?;
        if item.hash == Some(metadata.hash) {
            debug!(path = %path, "Server already holds the local content");
            if item.content_required {
                self.upload_content(&item.uid, path, metadata.size, ctl)
                    .await?;
            }
            return Ok(Applied::committed(IndexCommit::Upsert(current)));
        }

        if local_is_newer(local.modified, item.modified_at) {
            info!(path = %path, "Local version wins the conflict");
            let stored = self.modify_file(&current, &metadata, ctl).await?;
            Ok(Applied::committed(IndexCommit::Upsert(stored)))
        } else {
            info!(path = %path, "Server version wins the conflict");
            self.download_file(&current, self.options.keep_local_copy, ctl)
                .await
        }
    }
}

fn uploaded_entry(path: &RelativePath, item: &ServerItem, metadata: &FileMetadata) -> IndexEntry {
    IndexEntry::new(
        path.clone(),
        item.uid.clone(),
        item.revision.clone(),
        Some(metadata.hash),
        metadata.size,
        false,
    )
}

#[async_trait]
impl TransferExecutor for PipelineExecutor {
    type Plan = Plan;
    type Output = Applied;

    async fn prepare(&self, task: &TransferTask) -> Result<Plan, SyncError> {
        self.plan(task.event_id, &task.item).await
    }

    async fn run(
        &self,
        _task: &TransferTask,
        plan: &Plan,
        ctl: &TaskControl,
    ) -> Result<Applied, SyncError> {
        self.apply(plan, ctl).await
    }

    /// A create whose response was lost may have reached the server; adopt
    /// the item when it carries our content
    async fn recheck(
        &self,
        _task: &TransferTask,
        plan: &Plan,
        ctl: &TaskControl,
    ) -> Result<Option<Applied>, SyncError> {
        let (path, metadata) = match &plan.action {
            Action::CreateFile { path, metadata } => (path, Some(metadata)),
            Action::CreateFolder { path } => (path, None),
            _ => return Ok(None),
        };
        let Some(item) = ctl.call(self.lookup(path)).await? else {
            return Ok(None);
        };

        let entry = match metadata {
            None if item.is_folder => IndexEntry::new(
                path.clone(),
                item.uid,
                item.revision,
                None,
                0,
                true,
            ),
            Some(metadata) if !item.is_folder && item.hash == Some(metadata.hash) => {
                if item.content_required {
                    self.upload_content(&item.uid, path, metadata.size, ctl)
                        .await?;
                }
                uploaded_entry(path, &item, metadata)
            }
            _ => return Ok(None),
        };
        Ok(Some(Applied::committed(IndexCommit::Upsert(entry))))
    }

    async fn commit(
        &self,
        task: &TransferTask,
        _plan: Plan,
        output: Applied,
    ) -> Result<ItemOutcome, SyncError> {
        let Applied {
            commit,
            outcome,
            followups,
        } = output;
        // Uploads, server deletes and moves change the server's usage
        let touched_server =
            task.item.direction == Direction::ToServer && !matches!(commit, IndexCommit::Nothing);
        self.index
            .commit_event(task.event_id, commit)
            .await
            .map_err(SyncError::index)?;

        if touched_server {
            if let Err(e) = self
                .quota
                .refresh(self.rest.as_ref(), &self.guard, &self.ctx)
                .await
            {
                warn!(error = %e, "Quota refresh after commit failed");
            }
        }

        for change in followups {
            if self.followups.send(change).is_err() {
                debug!("Follow-up change dropped, engine is stopping");
            }
        }
        Ok(outcome)
    }

    async fn abandon(&self, _task: &TransferTask, plan: &Plan) {
        let path = match &plan.action {
            Action::Download { entry, .. } | Action::LocalRename { entry, .. } => &entry.path,
            _ => return,
        };
        if let Err(e) = self.fs.discard_partial(path).await {
            warn!(path = %path, error = %e, "Failed to discard partial download");
        }
    }

    async fn complete(&self, task: &TransferTask, result: &TransferResult) {
        let (status, outcome) = match result {
            TransferResult::Done(outcome) => (None, outcome.clone()),
            TransferResult::Failed(e) => (
                Some((EventStatus::Failed, Some(e.to_string()))),
                ItemOutcome::Failed(e.to_string()),
            ),
            TransferResult::Cancelled => {
                (Some((EventStatus::Cancelled, None)), ItemOutcome::Cancelled)
            }
            TransferResult::Interrupted => {
                debug!(event_id = %task.event_id, "Left pending for the next start");
                return;
            }
        };

        if let Some((status, error)) = status {
            if let Err(e) = self.index.finish_event(task.event_id, status, error).await {
                warn!(event_id = %task.event_id, error = %e, "Failed to record event outcome");
            }
        }
        self.report(task.event_id, task.item.primary_path().cloned(), outcome);
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Entry point for local changes and remote signals
///
/// Intake is serialized: planning order, event recording and supersede
/// decisions never interleave.
pub struct Reconciler {
    executor: Arc<PipelineExecutor>,
    scheduler: TransferScheduler<PipelineExecutor>,
    intake: Mutex<()>,
}

impl Reconciler {
    pub fn new(executor: Arc<PipelineExecutor>, options: SchedulerOptions) -> Self {
        let scheduler = TransferScheduler::new(Arc::clone(&executor), options);
        Self {
            executor,
            scheduler,
            intake: Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> &TransferScheduler<PipelineExecutor> {
        &self.scheduler
    }

    /// Record a local change and queue it
    ///
    /// # Errors
    /// `SyncError::Structural` for a malformed change (recorded as failed),
    /// an index error, or `SyncError::Cancelled` while shutting down
    #[instrument(skip(self, change), fields(kind = %change.kind, direction = %change.direction))]
    pub async fn process_local_change(&self, change: ChangeModel) -> Result<EventId, SyncError> {
        let _intake = self.intake.lock().await;
        self.accept(change).await
    }

    async fn accept(&self, change: ChangeModel) -> Result<EventId, SyncError> {
        let index = &self.executor.index;

        if let Err(e) = change.validate() {
            let id = index.record_event(&change).await.map_err(SyncError::index)?;
            index
                .finish_event(id, EventStatus::Failed, Some(e.to_string()))
                .await
                .map_err(SyncError::index)?;
            warn!(event_id = %id, error = %e, "Rejected malformed change");
            self.executor.report(
                id,
                change.primary_path().cloned(),
                ItemOutcome::Failed(e.to_string()),
            );
            return Err(e.into());
        }

        let id = index.record_event(&change).await.map_err(SyncError::index)?;
        self.dispatch(id, change).await?;
        Ok(id)
    }

    /// Supersede stale uploads, then hand the event to the scheduler
    async fn dispatch(&self, id: EventId, change: ChangeModel) -> Result<(), SyncError> {
        if change.direction == Direction::ToServer
            && matches!(change.kind, ChangeKind::Created | ChangeKind::Modified)
        {
            if let Some(path) = change.new_path.as_ref() {
                self.supersede(id, path).await?;
            }
        }

        let barrier = change.is_folder;
        let task = TransferTask::new(id, change)
            .ok_or_else(|| SyncError::Structural(format!("event {id} names no path")))?;
        let handle = self.scheduler.submit(task).await?;

        // Children must not overtake their folder
        if barrier {
            let result = handle.wait().await;
            debug!(event_id = %id, ?result, "Folder change settled");
        }
        Ok(())
    }

    /// Cancel queued or transferring uploads of older content for `path`;
    /// downloads and structural changes are never cancelled
    async fn supersede(&self, id: EventId, path: &RelativePath) -> Result<(), SyncError> {
        for task in self.scheduler.tasks_for_path(path) {
            if task.direction != TransferDirection::Upload {
                continue;
            }
            let record = self
                .executor
                .index
                .get_event(task.event_id)
                .await
                .map_err(SyncError::index)?;
            let content_upload = record.is_some_and(|r| {
                matches!(r.change.kind, ChangeKind::Created | ChangeKind::Modified)
                    && r.change.new_path.as_ref() == Some(path)
            });
            if content_upload && self.scheduler.try_cancel(task.event_id) {
                debug!(superseded = %task.event_id, by = %id, path = %path, "Superseded upload");
            }
        }
        Ok(())
    }

    /// Pull the server change list and queue every divergence
    ///
    /// Returns the number of divergences found.
    ///
    /// # Errors
    /// The server, index or scheduler error that stopped the pass; the
    /// cursor only advances past fully recorded pages
    #[instrument(skip(self))]
    pub async fn process_remote_signal(&self) -> Result<usize, SyncError> {
        let _intake = self.intake.lock().await;
        let index = &self.executor.index;

        let mut cursor = index.get_cursor().await.map_err(SyncError::index)?;
        let full_listing = cursor.is_none();
        let mut divergences = 0usize;

        loop {
            let page = self
                .executor
                .execute(&RestRequest::ChangesSince {
                    cursor: cursor.clone(),
                })
                .await?
                .into_changes()?;

            for item in &page.items {
                let Some(change) = self.diverges(item).await? else {
                    continue;
                };
                let id = index.record_event(&change).await.map_err(SyncError::index)?;
                self.dispatch(id, change).await?;
                divergences += 1;
            }

            index.set_cursor(&page.cursor).await.map_err(SyncError::index)?;
            if !page.has_more {
                break;
            }
            cursor = Some(page.cursor);
        }

        if divergences > 0 {
            info!(divergences, full_listing, "Queued remote changes");
        } else {
            debug!(full_listing, "No remote changes");
        }
        Ok(divergences)
    }

    /// Diff one server item against the index
    async fn diverges(&self, item: &ServerItem) -> Result<Option<ChangeModel>, SyncError> {
        if self.executor.options.is_ignored(&item.path) {
            return Ok(None);
        }
        let known = self
            .executor
            .index
            .find_by_server_uid(&item.uid)
            .await
            .map_err(SyncError::index)?;

        if item.is_deleted {
            return Ok(known.map(|entry| {
                ChangeModel::deleted(Direction::FromServer, entry.path, entry.is_folder)
                    .with_server_uid(item.uid.clone())
            }));
        }

        let change = match known {
            Some(entry) if entry.path != item.path => ChangeModel::renamed(
                Direction::FromServer,
                entry.path,
                item.path.clone(),
                item.is_folder,
            ),
            // Our own commit coming back
            Some(entry) if entry.revision == item.revision => return Ok(None),
            Some(entry) if entry.is_folder && item.is_folder => return Ok(None),
            Some(_) if !item.is_folder => ChangeModel::modified(Direction::FromServer, item.path.clone()),
            _ => ChangeModel::created(Direction::FromServer, item.path.clone(), item.is_folder),
        };
        Ok(Some(describe(change, item)))
    }

    /// Re-queue every event left pending by a previous run
    ///
    /// # Errors
    /// Index errors, or `SyncError::Cancelled` while shutting down
    pub async fn resume_pending(&self) -> Result<usize, SyncError> {
        let _intake = self.intake.lock().await;
        let pending = self
            .executor
            .index
            .pending_events()
            .await
            .map_err(SyncError::index)?;
        let count = pending.len();
        if count > 0 {
            info!(count, "Resuming pending changes");
        }
        for record in pending {
            self.dispatch(record.id, record.change).await?;
        }
        Ok(count)
    }

    /// Walk the sync root and queue changes made while the engine was not
    /// running
    ///
    /// # Errors
    /// Filesystem or index errors, or `SyncError::Cancelled` while shutting
    /// down
    #[instrument(skip(self))]
    pub async fn scan_local(&self) -> Result<usize, SyncError> {
        let _intake = self.intake.lock().await;
        let index = &self.executor.index;

        let mut known: HashMap<RelativePath, IndexEntry> = index
            .list_entries()
            .await
            .map_err(SyncError::index)?
            .into_iter()
            .map(|e| (e.path.clone(), e))
            .collect();
        let tree = self.executor.fs.walk().await.map_err(SyncError::io)?;

        let mut changes = Vec::new();
        for (path, state) in tree {
            if self.executor.options.is_ignored(&path) {
                continue;
            }
            let change = match known.remove(&path) {
                None => Some(ChangeModel::created(
                    Direction::ToServer,
                    path,
                    state.is_directory(),
                )),
                Some(entry) if entry.is_pending() => None,
                Some(entry) if entry.is_folder != state.is_directory() => Some(
                    ChangeModel::created(Direction::ToServer, path, state.is_directory()),
                ),
                Some(entry) if entry.is_folder => None,
                Some(entry) => {
                    let touched = entry.size != state.size
                        || state.modified.map_or(true, |m| m > entry.last_synced_at);
                    touched.then(|| ChangeModel::modified(Direction::ToServer, path))
                }
            };
            changes.extend(change);
        }

        // Indexed but gone; a removed folder covers its children
        let mut missing: Vec<IndexEntry> =
            known.into_values().filter(|e| !e.is_pending()).collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));
        let mut gone_folders: Vec<RelativePath> = Vec::new();
        for entry in missing {
            if gone_folders.iter().any(|f| entry.path.is_descendant_of(f)) {
                continue;
            }
            if entry.is_folder {
                gone_folders.push(entry.path.clone());
            }
            changes.push(ChangeModel::deleted(
                Direction::ToServer,
                entry.path,
                entry.is_folder,
            ));
        }

        let count = changes.len();
        for change in changes {
            match self.accept(change).await {
                Ok(_) => {}
                Err(SyncError::Structural(e)) => warn!(error = %e, "Skipping offline change"),
                Err(e) => return Err(e),
            }
        }
        if count > 0 {
            info!(count, "Queued offline changes");
        }
        Ok(count)
    }

    /// Transfers in both lanes with the coarse state they add up to
    pub fn status(&self) -> SyncStatus {
        let uploading = self.scheduler.snapshot(TransferDirection::Upload);
        let downloading = self.scheduler.snapshot(TransferDirection::Download);
        let all = uploading.iter().chain(downloading.iter());

        let state = if all.clone().any(|t| t.status == TransferStatus::Running) {
            EngineState::Syncing
        } else if all.count() > 0 {
            EngineState::Pending
        } else {
            EngineState::Idle
        };
        SyncStatus {
            state,
            uploading,
            downloading,
        }
    }

    /// Interrupt every transfer; unfinished events stay pending
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Wipe entries, events and cursor of a stopped engine
    ///
    /// Quota usage survives. The next start lists the whole syncbox and
    /// merges it with the local tree.
    ///
    /// # Errors
    /// Returns the index error
    pub async fn reset(index: &dyn ILocalIndex, ctx: &RequestContext) -> Result<(), SyncError> {
        index.reset().await.map_err(SyncError::index)?;
        info!(syncbox = %ctx.syncbox_id, "Local index reset");
        Ok(())
    }
}

#[async_trait]
impl RemoteSignalSink for Reconciler {
    async fn remote_signal(&self) -> Result<usize, SyncError> {
        self.process_remote_signal().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rel(s: &str) -> RelativePath {
        s.parse().unwrap()
    }

    fn item(path: &str) -> ServerItem {
        ServerItem {
            uid: ServerUid::new("S1".into()).unwrap(),
            path: rel(path),
            revision: Some("r2".into()),
            hash: Some(Digest128::from_bytes([7; 16])),
            size: 12,
            is_folder: false,
            is_deleted: false,
            created_at: None,
            modified_at: Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()),
            content_required: false,
        }
    }

    #[test]
    fn test_local_is_newer_needs_both_times() {
        let older = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        assert!(local_is_newer(Some(newer), Some(older)));
        assert!(!local_is_newer(Some(older), Some(newer)));
        assert!(!local_is_newer(Some(older), Some(older)));
        assert!(!local_is_newer(Some(newer), None));
        assert!(!local_is_newer(None, Some(older)));
    }

    #[test]
    fn test_describe_carries_server_metadata() {
        let item = item("docs/a.txt");
        let change = describe(
            ChangeModel::modified(Direction::FromServer, item.path.clone()),
            &item,
        );
        assert_eq!(change.server_uid, Some(item.uid.clone()));
        assert_eq!(change.revision.as_deref(), Some("r2"));
        assert_eq!(change.hash, item.hash);
        assert_eq!(change.size, Some(12));
        assert_eq!(change.modified_at, item.modified_at);
        assert!(change.validate().is_ok());
    }

    #[test]
    fn test_remote_entry_requires_uid() {
        let change = ChangeModel::created(Direction::FromServer, rel("a.txt"), false);
        assert!(matches!(
            remote_entry(&change, &rel("a.txt")),
            Err(SyncError::Structural(_))
        ));

        let change = describe(change, &item("a.txt"));
        let entry = remote_entry(&change, &rel("a.txt")).unwrap();
        assert_eq!(entry.server_uid.as_str(), "S1");
        assert_eq!(entry.size, 12);
        assert!(!entry.is_pending());
    }

    #[test]
    fn test_ignored_names() {
        let options = ReconcilerOptions {
            chunk_size: 1024,
            keep_local_copy: true,
            ignore_suffixes: vec![".swp".into(), "~".into()],
        };
        assert!(options.is_ignored(&rel("a.txt.swp")));
        assert!(options.is_ignored(&rel("dir/b~")));
        assert!(options.is_ignored(&rel(&format!("c.bin{PARTIAL_SUFFIX}"))));
        assert!(!options.is_ignored(&rel("notes.txt")));
    }

    #[test]
    fn test_conflict_subject_paths() {
        let entry = server_entry(&item("x/y.txt"));
        let action = Action::Move {
            entry: entry.clone(),
            to: rel("z.txt"),
            replaced: None,
            content: None,
        };
        assert_eq!(action.subject(), Some(&rel("x/y.txt")));
        assert_eq!(Action::Skip.subject(), None);
        assert_eq!(Action::LocalDelete { entry }.subject(), None);
    }
}
