//! Sync engine facade
//!
//! The [`SyncEngine`] owns the lifecycle of everything that runs while a
//! syncbox is live:
//!
//! 1. **Start**: watch the root, then resume pending events, pull the
//!    remote change list and scan for offline edits in the background
//! 2. **Live**: watcher → debouncer → driver → reconciler, plus the push
//!    supervisor and the quota loop
//! 3. **Stop**: cancel transfers, flush the debouncer, record leftovers as
//!    pending, wait for every background task
//!
//! Per-item failures never stop the engine; they surface through
//! [`EngineEvent::ItemCompleted`] and the transfer snapshots.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use boxsync_core::config::Config;
use boxsync_core::domain::{
    newtypes::{DeviceId, EventId, SyncPath, SyncboxId},
    ChangeModel, Credentials, EngineEvent, EngineState, SyncMode, SyncStatus,
};
use boxsync_core::ports::{
    ICredentialRefresher, ILocalFileSystem, ILocalIndex, IPushChannel, IRestClient,
    RequestContext,
};

use crate::credentials::CredentialGuard;
use crate::debouncer::{run_debounce_loop, Debouncer};
use crate::notification::{NotificationSupervisor, SupervisorOptions};
use crate::quota::{run_quota_loop, QuotaTracker};
use crate::reconciler::{PipelineDeps, PipelineExecutor, Reconciler, ReconcilerOptions};
use crate::registry::{EngineRegistry, ManagedEngine};
use crate::scheduler::SchedulerOptions;
use crate::watcher::FileWatcher;
use crate::{FatalEngineError, StartError, SyncError};

/// Capacity of the broadcast channel behind [`SyncEngine::subscribe`]
const EVENT_CAPACITY: usize = 256;

/// Debounced changes waiting for the driver
const CHANGE_CAPACITY: usize = 1024;

// ============================================================================
// Options and ports
// ============================================================================

/// Everything the engine needs to know besides its ports
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub root: SyncPath,
    pub ctx: RequestContext,
    pub debounce: Duration,
    pub reconciler: ReconcilerOptions,
    pub scheduler: SchedulerOptions,
    pub supervisor: SupervisorOptions,
    pub quota_interval: Duration,
    /// Days terminal events are kept
    pub event_retention_days: u32,
    /// Directory inside the root whose events are never synced, such as the
    /// one holding the index
    pub ignored_dir: Option<PathBuf>,
}

impl EngineOptions {
    /// Derive the options from a validated configuration
    ///
    /// # Errors
    /// `FatalEngineError::BadRootPath` for a relative root,
    /// `FatalEngineError::InvalidConfig` for an unusable device id
    pub fn from_config(config: &Config) -> Result<Self, FatalEngineError> {
        let root = SyncPath::new(config.sync.root.clone())
            .map_err(|e| FatalEngineError::BadRootPath(e.to_string()))?;
        let device_id = DeviceId::new(config.server.device_id.clone())
            .map_err(|e| FatalEngineError::InvalidConfig(format!("server.device_id: {e}")))?;

        let ignored_dir = config
            .index
            .path
            .parent()
            .filter(|dir| dir.starts_with(root.as_path()) && *dir != root.as_path())
            .map(PathBuf::from);

        Ok(Self {
            root,
            ctx: RequestContext {
                device_id,
                syncbox_id: SyncboxId::new(config.server.syncbox_id),
            },
            debounce: config.sync.debounce(),
            reconciler: ReconcilerOptions::from_config(config),
            scheduler: SchedulerOptions::from_config(
                &config.transfers,
                config.server.request_timeout(),
            ),
            supervisor: SupervisorOptions::from(&config.notifications),
            quota_interval: config.quota.refresh_interval(),
            event_retention_days: config.index.event_retention_days,
            ignored_dir,
        })
    }
}

/// Adapters the engine drives
#[derive(Clone)]
pub struct EnginePorts {
    pub index: Arc<dyn ILocalIndex>,
    pub fs: Arc<dyn ILocalFileSystem>,
    pub rest: Arc<dyn IRestClient>,
    pub push: Arc<dyn IPushChannel>,
    pub refresher: Arc<dyn ICredentialRefresher>,
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Background work of a started engine
struct Running {
    reconciler: Arc<Reconciler>,
    quota: Arc<QuotaTracker>,
    cancel: CancellationToken,
    /// Catch-up pass, supervisor and quota loop
    tracker: TaskTracker,
    watcher: FileWatcher,
    debounce: JoinHandle<Vec<ChangeModel>>,
    driver: JoinHandle<Vec<ChangeModel>>,
}

pub struct SyncEngine {
    ports: EnginePorts,
    guard: CredentialGuard,
    options: EngineOptions,
    events: broadcast::Sender<EngineEvent>,
    registry: Arc<EngineRegistry>,
    running: Mutex<Option<Running>>,
    me: Weak<SyncEngine>,
}

impl SyncEngine {
    /// Create a stopped engine registered with the process-wide registry
    /// once started
    pub fn new(ports: EnginePorts, credentials: Credentials, options: EngineOptions) -> Arc<Self> {
        Self::with_registry(ports, credentials, options, EngineRegistry::global())
    }

    pub fn with_registry(
        ports: EnginePorts,
        credentials: Credentials,
        options: EngineOptions,
        registry: Arc<EngineRegistry>,
    ) -> Arc<Self> {
        let guard = CredentialGuard::new(credentials, Arc::clone(&ports.refresher));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            ports,
            guard,
            options,
            events,
            registry,
            running: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start live synchronization
    ///
    /// Returns once the watcher is live. Resuming pending events, pulling
    /// the remote change list and queueing offline local edits continue in
    /// the background, so status queries and `stop` are served meanwhile.
    ///
    /// # Errors
    /// `UnsupportedMode` for anything but `LiveSync`, `AlreadyStarted`,
    /// `BadRootPath`, `DuplicateRoot` when another engine serves the root,
    /// `IndexCorrupted` when the index cannot be read
    #[instrument(skip(self), fields(root = %self.options.root.as_path().display()))]
    pub async fn start(&self, mode: SyncMode) -> Result<(), StartError> {
        if mode != SyncMode::LiveSync {
            return Err(FatalEngineError::UnsupportedMode(mode));
        }
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(FatalEngineError::AlreadyStarted);
        }

        let root = self.options.root.as_path();
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(FatalEngineError::BadRootPath(format!(
                    "{} is not a directory",
                    root.display()
                )))
            }
            Err(e) => {
                return Err(FatalEngineError::BadRootPath(format!(
                    "{}: {e}",
                    root.display()
                )))
            }
        }

        let me: Weak<dyn ManagedEngine> = self.me.clone();
        self.registry.register(me)?;

        match self.launch().await {
            Ok(started) => {
                *running = Some(started);
                info!("Live sync started");
                let _ = self.events.send(EngineEvent::LiveSyncStarted);
                Ok(())
            }
            Err(e) => {
                self.registry.unregister(root);
                error!(error = %e, "Engine failed to start");
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running, StartError> {
        let index = &self.ports.index;
        let ctx = &self.options.ctx;

        index
            .pending_events()
            .await
            .map_err(|e| FatalEngineError::IndexCorrupted(format!("{e:#}")))?;
        let horizon =
            chrono::Utc::now() - chrono::Duration::days(i64::from(self.options.event_retention_days));
        match index.prune_events(horizon).await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned old events"),
            Err(e) => warn!(error = %e, "Failed to prune old events"),
        }

        let quota = Arc::new(
            QuotaTracker::restore(Arc::clone(index), self.events.clone())
                .await
                .map_err(|e| FatalEngineError::Index(format!("{e:#}")))?,
        );

        let (executor, followups) = PipelineExecutor::new(
            PipelineDeps {
                index: Arc::clone(index),
                fs: Arc::clone(&self.ports.fs),
                rest: Arc::clone(&self.ports.rest),
                guard: self.guard.clone(),
                ctx: ctx.clone(),
                events: self.events.clone(),
                quota: Arc::clone(&quota),
            },
            self.options.reconciler.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(executor),
            self.options.scheduler.clone(),
        ));
        let cancel = CancellationToken::new();

        // Watch before scanning so edits made during the scan are not lost
        let (mut watcher, raw_rx) =
            FileWatcher::new().map_err(|e| FatalEngineError::BadRootPath(format!("{e:#}")))?;
        watcher
            .watch(self.options.root.as_path())
            .map_err(|e| FatalEngineError::BadRootPath(format!("{e:#}")))?;

        let mut debouncer = Debouncer::new(self.options.root.clone(), self.options.debounce)
            .with_ignore_suffixes(self.options.reconciler.ignore_suffixes.iter().cloned());
        if let Some(dir) = &self.options.ignored_dir {
            debouncer = debouncer.with_ignored_dir(dir.clone());
        }
        let (change_tx, change_rx) = mpsc::channel(CHANGE_CAPACITY);
        let debounce = tokio::spawn(run_debounce_loop(
            debouncer,
            raw_rx,
            change_tx,
            cancel.child_token(),
        ));
        let driver = tokio::spawn(drive(
            Arc::clone(&reconciler),
            change_rx,
            followups,
            cancel.child_token(),
        ));

        let tracker = TaskTracker::new();
        tracker.spawn(catch_up(Arc::clone(&reconciler), cancel.child_token()));
        let supervisor = Arc::new(NotificationSupervisor::new(
            Arc::clone(&self.ports.push),
            self.guard.clone(),
            ctx.clone(),
            reconciler.clone(),
            self.events.clone(),
            self.options.supervisor.clone(),
        ));
        tracker.spawn(supervisor.run(cancel.child_token()));
        tracker.spawn(run_quota_loop(
            Arc::clone(&quota),
            Arc::clone(&self.ports.rest),
            self.guard.clone(),
            ctx.clone(),
            self.options.quota_interval,
            cancel.child_token(),
        ));

        Ok(Running {
            reconciler,
            quota,
            cancel,
            tracker,
            watcher,
            debounce,
            driver,
        })
    }

    /// Stop live synchronization
    ///
    /// Stopping a stopped engine is a no-op.
    ///
    /// # Errors
    /// `FatalEngineError::Index` when leftover changes could not be recorded
    #[instrument(skip(self), fields(root = %self.options.root.as_path().display()))]
    pub async fn stop(&self) -> Result<(), FatalEngineError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let Running {
            reconciler,
            quota,
            cancel,
            tracker,
            watcher,
            debounce,
            driver,
        } = running;

        info!("Stopping live sync");
        cancel.cancel();
        drop(watcher);
        reconciler.shutdown().await;

        let mut leftovers = debounce.await.unwrap_or_else(|e| {
            error!(error = %e, "Debounce loop panicked");
            Vec::new()
        });
        leftovers.extend(driver.await.unwrap_or_else(|e| {
            error!(error = %e, "Driver panicked");
            Vec::new()
        }));

        tracker.close();
        tracker.wait().await;

        let recorded = self.record_leftovers(leftovers).await;
        let state = quota.state().await;
        debug!(usage = state.usage_bytes, "Quota state at stop");

        self.registry.unregister(self.options.root.as_path());
        let _ = self.events.send(EngineEvent::LiveSyncStopped);
        info!("Live sync stopped");
        recorded
    }

    /// Record changes that never reached the pipeline so the next start
    /// resumes them
    async fn record_leftovers(&self, leftovers: Vec<ChangeModel>) -> Result<(), FatalEngineError> {
        let mut failure = None;
        for change in leftovers {
            if let Err(e) = change.validate() {
                warn!(error = %e, "Dropping malformed change");
                continue;
            }
            match self.ports.index.record_event(&change).await {
                Ok(id) => debug!(event_id = %id, "Recorded change for the next start"),
                Err(e) => {
                    error!(error = %e, "Failed to record change");
                    failure = Some(FatalEngineError::Index(format!("{e:#}")));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Wipe the local index of a stopped engine
    ///
    /// # Errors
    /// `FatalEngineError::NotStopped` while started, without touching the
    /// index; `FatalEngineError::Index` when the wipe fails
    pub async fn reset_local_cache(&self) -> Result<(), FatalEngineError> {
        let running = self.running.lock().await;
        if running.is_some() {
            return Err(FatalEngineError::NotStopped);
        }
        Reconciler::reset(self.ports.index.as_ref(), &self.options.ctx)
            .await
            .map_err(|e| FatalEngineError::Index(e.to_string()))
    }

    pub async fn current_status(&self) -> SyncStatus {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return SyncStatus::idle();
        };
        let mut status = running.reconciler.status();
        if running.debounce.is_finished() || running.driver.is_finished() {
            status.state = EngineState::Error;
        }
        status
    }

    /// The change recorded under `id`, and whether it is still pending
    ///
    /// # Errors
    /// `FatalEngineError::Index` when the index cannot be read
    pub async fn query_event_by_id(
        &self,
        id: EventId,
    ) -> Result<Option<(ChangeModel, bool)>, FatalEngineError> {
        let record = self
            .ports
            .index
            .get_event(id)
            .await
            .map_err(|e| FatalEngineError::Index(format!("{e:#}")))?;
        Ok(record.map(|r| {
            let pending = r.is_pending();
            (r.change, pending)
        }))
    }
}

#[async_trait]
impl ManagedEngine for SyncEngine {
    fn root(&self) -> &std::path::Path {
        self.options.root.as_path()
    }

    async fn stop(&self) -> Result<(), FatalEngineError> {
        SyncEngine::stop(self).await
    }
}

/// Resume, pull and scan until done or `cancel` fires; failures here are
/// retried by the supervisor and the next start
///
/// Whatever was recorded before a stop stays pending for the next start.
async fn catch_up(reconciler: Arc<Reconciler>, cancel: CancellationToken) {
    let steps = async {
        match reconciler.resume_pending().await {
            Ok(n) if n > 0 => info!(resumed = n, "Resumed pending changes"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to resume pending changes"),
        }
        if let Err(e) = reconciler.process_remote_signal().await {
            warn!(error = %e, "Initial remote pass failed");
        }
        if let Err(e) = reconciler.scan_local().await {
            warn!(error = %e, "Local scan failed");
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => debug!("Catch-up interrupted"),
        _ = steps => debug!("Catch-up finished"),
    }
}

/// Feed debounced and follow-up changes to the reconciler until `cancel`
/// fires; returns what was still queued
async fn drive(
    reconciler: Arc<Reconciler>,
    mut changes: mpsc::Receiver<ChangeModel>,
    mut followups: mpsc::UnboundedReceiver<ChangeModel>,
    cancel: CancellationToken,
) -> Vec<ChangeModel> {
    loop {
        let change = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(change) = followups.recv() => change,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        match reconciler.process_local_change(change).await {
            Ok(id) => debug!(event_id = %id, "Change accepted"),
            // Recorded already; resumed on the next start
            Err(SyncError::Cancelled) => break,
            Err(e) => warn!(error = %e, "Change rejected"),
        }
    }

    let mut leftovers = Vec::new();
    while let Ok(change) = changes.try_recv() {
        leftovers.push(change);
    }
    while let Ok(change) = followups.try_recv() {
        leftovers.push(change);
    }
    debug!(count = leftovers.len(), "Driver stopped");
    leftovers
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxsync_core::config::ConfigBuilder;

    #[test]
    fn test_options_from_config() {
        let config = ConfigBuilder::new()
            .sync_root(PathBuf::from("/home/user/Boxsync"))
            .server_device_id("laptop-1")
            .server_syncbox_id(42)
            .sync_debounce_ms(750)
            .conflicts_keep_local_copy(true)
            .index_path(PathBuf::from("/home/user/Boxsync/.boxsync/index.db"))
            .build();

        let options = EngineOptions::from_config(&config).unwrap();
        assert_eq!(options.ctx.device_id.as_str(), "laptop-1");
        assert_eq!(options.ctx.syncbox_id, SyncboxId::new(42));
        assert_eq!(options.debounce, Duration::from_millis(750));
        assert!(options.reconciler.keep_local_copy);
        assert_eq!(
            options.ignored_dir,
            Some(PathBuf::from("/home/user/Boxsync/.boxsync"))
        );
    }

    #[test]
    fn test_index_outside_root_is_not_ignored() {
        let config = ConfigBuilder::new()
            .sync_root(PathBuf::from("/home/user/Boxsync"))
            .server_device_id("laptop-1")
            .index_path(PathBuf::from("/var/lib/boxsync/index.db"))
            .build();
        let options = EngineOptions::from_config(&config).unwrap();
        assert_eq!(options.ignored_dir, None);
    }

    #[test]
    fn test_relative_root_is_rejected() {
        let config = ConfigBuilder::new()
            .sync_root(PathBuf::from("relative/root"))
            .server_device_id("laptop-1")
            .build();
        assert!(matches!(
            EngineOptions::from_config(&config),
            Err(FatalEngineError::BadRootPath(_))
        ));
    }
}
