//! Shared fakes for the engine and pipeline tests
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::broadcast;

use boxsync_cache::{IndexPool, SqliteLocalIndex};
use boxsync_core::config::ConfigBuilder;
use boxsync_core::domain::{
    newtypes::{Cursor, DeviceId, Digest128, RelativePath, ServerUid, SyncPath, SyncboxId},
    Credentials, EngineEvent, ItemOutcome,
};
use boxsync_core::ports::{
    ChangePage, ICredentialRefresher, IPushChannel, IRestClient, PushMessage, QuotaReading,
    RequestContext, RestError, RestRequest, RestResponse, ServerItem, UploadChunk,
};
use boxsync_sync::engine::{EngineOptions, EnginePorts};
use boxsync_sync::filesystem::{md5_bytes, LocalFileSystemAdapter};
use boxsync_sync::credentials::CredentialGuard;
use boxsync_sync::quota::QuotaTracker;
use boxsync_sync::reconciler::{PipelineDeps, PipelineExecutor, Reconciler, ReconcilerOptions};
use boxsync_sync::scheduler::SchedulerOptions;

pub const DEVICE: &str = "device-1";
pub const SYNCBOX: i64 = 7;

pub fn rel(path: &str) -> RelativePath {
    path.parse().expect("valid relative path")
}

// ============================================================================
// FakeServer
// ============================================================================

#[derive(Debug, Clone)]
struct Stored {
    uid: ServerUid,
    revision: u64,
    is_folder: bool,
    hash: Option<Digest128>,
    size: u64,
    content: Vec<u8>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    content_required: bool,
}

#[derive(Default)]
struct ServerState {
    items: BTreeMap<RelativePath, Stored>,
    /// Every change, in order; a cursor is an offset into this log
    log: Vec<ServerItem>,
    keys: HashMap<String, ServerUid>,
    next_uid: u64,
    lose_next_create: bool,
    requests: Vec<&'static str>,
    delays: HashMap<&'static str, Duration>,
    limit: u64,
}

/// In-memory sync server honouring revisions and idempotency keys
pub struct FakeServer {
    state: Mutex<ServerState>,
    page_size: usize,
}

fn item_of(path: &RelativePath, stored: &Stored) -> ServerItem {
    ServerItem {
        uid: stored.uid.clone(),
        path: path.clone(),
        revision: Some(stored.revision.to_string()),
        hash: stored.hash,
        size: stored.size,
        is_folder: stored.is_folder,
        is_deleted: false,
        created_at: Some(stored.created_at),
        modified_at: Some(stored.modified_at),
        content_required: stored.content_required,
    }
}

fn tombstone(path: &RelativePath, stored: &Stored) -> ServerItem {
    ServerItem {
        is_deleted: true,
        ..item_of(path, stored)
    }
}

impl ServerState {
    fn new_uid(&mut self) -> ServerUid {
        self.next_uid += 1;
        ServerUid::new(format!("S{}", self.next_uid)).expect("valid uid")
    }

    fn find_uid(&self, uid: &ServerUid) -> Option<RelativePath> {
        self.items
            .iter()
            .find(|(_, s)| &s.uid == uid)
            .map(|(p, _)| p.clone())
    }

    fn check_revision(&self, path: &RelativePath, revision: &Option<String>) -> Result<(), RestError> {
        let stored = &self.items[path];
        match revision {
            Some(r) if *r != stored.revision.to_string() => Err(RestError::Conflict {
                message: format!("{path} is at revision {}", stored.revision),
                current_revision: Some(stored.revision.to_string()),
            }),
            _ => Ok(()),
        }
    }

    fn upsert(&mut self, path: RelativePath, stored: Stored) -> ServerItem {
        let item = item_of(&path, &stored);
        self.log.push(item.clone());
        self.items.insert(path, stored);
        item
    }

    fn remove_tree(&mut self, path: &RelativePath) {
        if let Some(stored) = self.items.remove(path) {
            self.log.push(tombstone(path, &stored));
        }
        self.items.retain(|p, _| !p.is_descendant_of(path));
    }
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                limit: 1 << 30,
                ..ServerState::default()
            }),
            page_size: 2,
        })
    }

    /// Server-side write of a file, as another device would do it
    pub fn put_file(&self, path: &str, content: &[u8]) -> ServerItem {
        self.put_file_at(path, content, Utc::now())
    }

    pub fn put_file_at(&self, path: &str, content: &[u8], modified_at: DateTime<Utc>) -> ServerItem {
        let mut state = self.state.lock().unwrap();
        let path = rel(path);
        let (uid, revision, created_at) = match state.items.get(&path) {
            Some(s) => (s.uid.clone(), s.revision + 1, s.created_at),
            None => (state.new_uid(), 1, modified_at),
        };
        state.upsert(
            path,
            Stored {
                uid,
                revision,
                is_folder: false,
                hash: Some(md5_bytes(content)),
                size: content.len() as u64,
                content: content.to_vec(),
                created_at,
                modified_at,
                content_required: false,
            },
        )
    }

    pub fn put_folder(&self, path: &str) -> ServerItem {
        let mut state = self.state.lock().unwrap();
        let uid = state.new_uid();
        let now = Utc::now();
        state.upsert(
            rel(path),
            Stored {
                uid,
                revision: 1,
                is_folder: true,
                hash: None,
                size: 0,
                content: Vec::new(),
                created_at: now,
                modified_at: now,
                content_required: false,
            },
        )
    }

    /// Server-side delete, as another device would do it
    pub fn delete(&self, path: &str) {
        self.state.lock().unwrap().remove_tree(&rel(path));
    }

    pub fn item(&self, path: &str) -> Option<ServerItem> {
        let state = self.state.lock().unwrap();
        let path = rel(path);
        state.items.get(&path).map(|s| item_of(&path, s))
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(&rel(path))
            .map(|s| s.content.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .items
            .keys()
            .map(|p| p.as_str().to_string())
            .collect()
    }

    pub fn set_limit(&self, limit: u64) {
        self.state.lock().unwrap().limit = limit;
    }

    /// Apply the next create but answer it with a transport error
    pub fn lose_next_create_response(&self) {
        self.state.lock().unwrap().lose_next_create = true;
    }

    /// Hold every `name` request for `by` before serving it
    pub fn delay(&self, name: &'static str, by: Duration) {
        self.state.lock().unwrap().delays.insert(name, by);
    }

    /// Log a request and wait out its configured delay
    async fn arrive(&self, name: &'static str) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(name);
            state.delays.get(name).copied().unwrap_or_default()
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn request_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| **r == name)
            .count()
    }

    fn create(
        &self,
        path: &RelativePath,
        key: &str,
        is_folder: bool,
        hash: Option<Digest128>,
        size: u64,
    ) -> Result<RestResponse, RestError> {
        let mut state = self.state.lock().unwrap();
        if let Some(uid) = state.keys.get(key).cloned() {
            let path = state
                .find_uid(&uid)
                .ok_or_else(|| RestError::NotFound(uid.to_string()))?;
            return Ok(RestResponse::Item(item_of(&path, &state.items[&path])));
        }
        if let Some(existing) = state.items.get(path) {
            return Err(RestError::Conflict {
                message: format!("{path} already exists"),
                current_revision: Some(existing.revision.to_string()),
            });
        }

        let uid = state.new_uid();
        state.keys.insert(key.to_string(), uid.clone());
        let now = Utc::now();
        let item = state.upsert(
            path.clone(),
            Stored {
                uid,
                revision: 1,
                is_folder,
                hash,
                size,
                content: Vec::new(),
                created_at: now,
                modified_at: now,
                content_required: !is_folder,
            },
        );

        if std::mem::take(&mut state.lose_next_create) {
            return Err(RestError::Transport("connection reset".into()));
        }
        Ok(RestResponse::Item(item))
    }
}

#[async_trait]
impl IRestClient for FakeServer {
    async fn execute(
        &self,
        _credentials: &Credentials,
        ctx: &RequestContext,
        request: &RestRequest,
    ) -> Result<RestResponse, RestError> {
        assert_eq!(ctx.device_id.as_str(), DEVICE);
        self.arrive(request.name()).await;

        match request {
            RestRequest::CreateFile {
                path,
                metadata,
                idempotency_key,
            } => self.create(
                path,
                idempotency_key,
                false,
                Some(metadata.hash),
                metadata.size,
            ),
            RestRequest::CreateFolder {
                path,
                idempotency_key,
            } => self.create(path, idempotency_key, true, None, 0),
            RestRequest::ModifyFile {
                server_uid,
                metadata,
                revision,
                ..
            } => {
                let mut state = self.state.lock().unwrap();
                let path = state
                    .find_uid(server_uid)
                    .ok_or_else(|| RestError::NotFound(server_uid.to_string()))?;
                state.check_revision(&path, revision)?;
                let mut stored = state.items[&path].clone();
                stored.revision += 1;
                stored.hash = Some(metadata.hash);
                stored.size = metadata.size;
                stored.content.clear();
                stored.content_required = true;
                stored.modified_at = Utc::now();
                Ok(RestResponse::Item(state.upsert(path, stored)))
            }
            RestRequest::Delete {
                server_uid,
                revision,
                ..
            } => {
                let mut state = self.state.lock().unwrap();
                let path = state
                    .find_uid(server_uid)
                    .ok_or_else(|| RestError::NotFound(server_uid.to_string()))?;
                state.check_revision(&path, revision)?;
                state.remove_tree(&path);
                Ok(RestResponse::Removed)
            }
            RestRequest::Move {
                server_uid,
                to,
                revision,
                ..
            } => {
                let mut state = self.state.lock().unwrap();
                let from = state
                    .find_uid(server_uid)
                    .ok_or_else(|| RestError::NotFound(server_uid.to_string()))?;
                state.check_revision(&from, revision)?;
                let moved: Vec<(RelativePath, Stored)> = state
                    .items
                    .iter()
                    .filter(|(p, _)| p.is_descendant_of(&from))
                    .map(|(p, s)| (p.clone(), s.clone()))
                    .collect();
                for (path, stored) in moved {
                    state.items.remove(&path);
                    if let Some(rebased) = path.rebase(&from, to) {
                        state.items.insert(rebased, stored);
                    }
                }
                let mut stored = state.items.remove(&from).expect("found above");
                stored.revision += 1;
                stored.content_required = false;
                Ok(RestResponse::Item(state.upsert(to.clone(), stored)))
            }
            RestRequest::GetMetadata { path } => {
                let state = self.state.lock().unwrap();
                state
                    .items
                    .get(path)
                    .map(|s| RestResponse::Item(item_of(path, s)))
                    .ok_or_else(|| RestError::NotFound(path.to_string()))
            }
            RestRequest::ChangesSince { cursor } => {
                let state = self.state.lock().unwrap();
                let (items, end) = match cursor {
                    None => (
                        state.items.iter().map(|(p, s)| item_of(p, s)).collect(),
                        state.log.len(),
                    ),
                    Some(cursor) => {
                        let start: usize = cursor.as_str().parse().unwrap_or(0);
                        let end = (start + self.page_size).min(state.log.len());
                        (state.log[start.min(end)..end].to_vec(), end)
                    }
                };
                Ok(RestResponse::Changes(ChangePage {
                    items,
                    cursor: Cursor::new(end.to_string()).expect("valid cursor"),
                    has_more: end < state.log.len(),
                }))
            }
            RestRequest::GetQuota => {
                let state = self.state.lock().unwrap();
                Ok(RestResponse::Quota(QuotaReading {
                    usage_bytes: state.items.values().map(|s| s.size).sum(),
                    limit_bytes: state.limit,
                }))
            }
        }
    }

    async fn upload_chunk(
        &self,
        _credentials: &Credentials,
        _ctx: &RequestContext,
        chunk: &UploadChunk,
    ) -> Result<(), RestError> {
        self.arrive("upload_chunk").await;
        let mut state = self.state.lock().unwrap();
        let path = state
            .find_uid(&chunk.server_uid)
            .ok_or_else(|| RestError::NotFound(chunk.server_uid.to_string()))?;
        let stored = state.items.get_mut(&path).expect("found above");
        stored.content.truncate(chunk.offset as usize);
        stored.content.extend_from_slice(&chunk.data);
        if stored.content.len() as u64 >= chunk.total_size {
            stored.content_required = false;
        }
        Ok(())
    }

    async fn download_chunk(
        &self,
        _credentials: &Credentials,
        _ctx: &RequestContext,
        server_uid: &ServerUid,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, RestError> {
        self.arrive("download_chunk").await;
        let state = self.state.lock().unwrap();
        let path = state
            .find_uid(server_uid)
            .ok_or_else(|| RestError::NotFound(server_uid.to_string()))?;
        let content = &state.items[&path].content;
        let start = (offset as usize).min(content.len());
        let end = (start + len as usize).min(content.len());
        Ok(content[start..end].to_vec())
    }
}

// ============================================================================
// Push channel and refresher
// ============================================================================

/// Push channel that accepts the subscription and never delivers
pub struct SilentPush;

#[async_trait]
impl IPushChannel for SilentPush {
    async fn subscribe(&self, _: &Credentials, _: &RequestContext) -> Result<(), RestError> {
        Ok(())
    }

    async fn next_message(&self) -> Result<PushMessage, RestError> {
        std::future::pending().await
    }

    async fn unsubscribe(&self) {}
}

pub struct NoRefresh;

#[async_trait]
impl ICredentialRefresher for NoRefresh {
    async fn refresh(&self, _: &Credentials) -> anyhow::Result<Option<Credentials>> {
        Ok(None)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    _dir: TempDir,
    pub root: PathBuf,
    pub index: Arc<SqliteLocalIndex>,
    pub fs: Arc<LocalFileSystemAdapter>,
    pub server: Arc<FakeServer>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let pool = IndexPool::in_memory().await.unwrap();
        let index = Arc::new(SqliteLocalIndex::new(pool.pool().clone()));
        let fs = Arc::new(LocalFileSystemAdapter::new(
            SyncPath::new(root.clone()).unwrap(),
        ));
        Self {
            _dir: dir,
            root,
            index,
            fs,
            server: FakeServer::new(),
        }
    }

    pub fn ctx() -> RequestContext {
        RequestContext {
            device_id: DeviceId::new(DEVICE.into()).unwrap(),
            syncbox_id: SyncboxId::new(SYNCBOX),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write(&self, rel: &str, content: &[u8]) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).exists()
    }

    pub fn files_in(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path(dir))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Set a file's modification time
    pub fn touch_at(&self, rel: &str, time: DateTime<Utc>) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.path(rel))
            .unwrap();
        file.set_modified(time.into()).unwrap();
    }

    pub fn scheduler_options() -> SchedulerOptions {
        SchedulerOptions {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            call_timeout: Duration::from_secs(5),
            ..SchedulerOptions::default()
        }
    }

    /// A reconciler wired to the harness, outside any engine
    pub fn pipeline(
        &self,
        keep_local_copy: bool,
    ) -> (
        Reconciler,
        broadcast::Receiver<EngineEvent>,
        tokio::sync::mpsc::UnboundedReceiver<boxsync_core::domain::ChangeModel>,
    ) {
        let (events, rx) = broadcast::channel(256);
        let quota = Arc::new(QuotaTracker::new(self.index.clone(), events.clone()));
        let (executor, followups) = PipelineExecutor::new(
            PipelineDeps {
                index: self.index.clone(),
                fs: self.fs.clone(),
                rest: self.server.clone(),
                guard: CredentialGuard::new(Credentials::new("key", "secret"), Arc::new(NoRefresh)),
                ctx: Self::ctx(),
                events,
                quota,
            },
            ReconcilerOptions {
                chunk_size: 4,
                keep_local_copy,
                ignore_suffixes: vec![".swp".into()],
            },
        );
        (
            Reconciler::new(Arc::new(executor), Self::scheduler_options()),
            rx,
            followups,
        )
    }

    pub fn engine_options(&self) -> EngineOptions {
        let config = ConfigBuilder::new()
            .sync_root(self.root.clone())
            .server_device_id(DEVICE)
            .server_syncbox_id(SYNCBOX)
            .sync_debounce_ms(100)
            .transfers_backoff_ms(10, 50)
            .notifications_push_enabled(false)
            .notifications_poll_interval_secs(3600)
            .build();
        EngineOptions::from_config(&config).unwrap()
    }

    pub fn engine_ports(&self) -> EnginePorts {
        EnginePorts {
            index: self.index.clone(),
            fs: self.fs.clone(),
            rest: self.server.clone(),
            push: Arc::new(SilentPush),
            refresher: Arc::new(NoRefresh),
        }
    }
}

/// Wait for the terminal event of the change touching `path`
pub async fn completion_for(
    rx: &mut broadcast::Receiver<EngineEvent>,
    path: &str,
) -> ItemOutcome {
    let path = rel(path);
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::ItemCompleted {
                    path: Some(p),
                    outcome,
                    ..
                }) if p == path => return outcome,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no completion for {path}"))
}
