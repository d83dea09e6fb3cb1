//! Transfer scheduler - bounded, retrying, per-path serialized workers
//!
//! The [`TransferScheduler`] runs [`TransferTask`]s on two independent lanes
//! (upload and download). The work itself is delegated to a
//! [`TransferExecutor`]; the scheduler owns ordering, concurrency, retries
//! and cancellation.
//!
//! ## Task lifecycle
//!
//! ```text
//! submit ──► queue slot ──► path ticket ──► worker permit ──► prepare
//!                                                               │
//!          ┌──────────── backoff (Retrying) ◄── transient ──────┤
//!          ▼                                                    ▼
//!       recheck ──► run ────────────────────────────► commit ──► complete
//! ```
//!
//! - `submit` waits for a lane queue slot, so a full lane pushes back on
//!   the caller.
//! - `submit` also takes a ticket on every path the task touches. Tickets
//!   are served in submission order and held through commit: at most one
//!   task per path is ever running, and tasks on a path run in order.
//! - Transient failures retry with `base * 2^attempt` (capped) delays, or
//!   the server's `Retry-After`. Before each retry the executor may recheck
//!   the server and adopt a result left by a previous attempt.
//! - Cancellation is cooperative and checked at dequeue time, between
//!   attempts and wherever the executor calls [`TaskControl::checkpoint`].
//!   A cancelled task never commits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use boxsync_core::config::TransferConfig;
use boxsync_core::domain::{
    newtypes::{EventId, RelativePath},
    ItemOutcome, TransferDirection, TransferSnapshot, TransferStatus, TransferTask,
};

use crate::SyncError;

/// Unknown total size marker
const UNKNOWN_TOTAL: u64 = u64::MAX;

// ============================================================================
// Options
// ============================================================================

/// Tuning knobs of the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub upload_concurrent: usize,
    pub download_concurrent: usize,
    /// Queue slots per lane (queued plus running tasks)
    pub queue_depth: usize,
    /// Total attempts per task, first one included
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Timeout applied to each individual call made through
    /// [`TaskControl::call`]
    pub call_timeout: Duration,
}

impl SchedulerOptions {
    pub fn from_config(config: &TransferConfig, call_timeout: Duration) -> Self {
        Self {
            upload_concurrent: config.upload_concurrent.max(1) as usize,
            download_concurrent: config.download_concurrent.max(1) as usize,
            queue_depth: config.queue_depth.max(1) as usize,
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            call_timeout,
        }
    }

    /// Delay before retry number `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default(), Duration::from_secs(30))
    }
}

// ============================================================================
// Executor seam
// ============================================================================

/// Final result of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    /// Committed, or there was nothing to do
    Done(ItemOutcome),
    /// Terminal failure; the task will not be retried
    Failed(SyncError),
    /// Cancelled on request; nothing was committed
    Cancelled,
    /// Stopped by scheduler shutdown; the change should be resumed later
    Interrupted,
}

/// The work behind a [`TransferTask`]
///
/// `prepare` runs once, `run` once per attempt, `recheck` before every retry
/// and `commit` once after a successful attempt. `complete` always runs
/// last, still under the task's path locks.
#[async_trait]
pub trait TransferExecutor: Send + Sync + 'static {
    type Plan: Send + Sync + 'static;
    type Output: Send + 'static;

    async fn prepare(&self, task: &TransferTask) -> Result<Self::Plan, SyncError>;

    async fn run(
        &self,
        task: &TransferTask,
        plan: &Self::Plan,
        ctl: &TaskControl,
    ) -> Result<Self::Output, SyncError>;

    /// Look for the effect of an earlier attempt before retrying
    async fn recheck(
        &self,
        _task: &TransferTask,
        _plan: &Self::Plan,
        _ctl: &TaskControl,
    ) -> Result<Option<Self::Output>, SyncError> {
        Ok(None)
    }

    async fn commit(
        &self,
        task: &TransferTask,
        plan: Self::Plan,
        output: Self::Output,
    ) -> Result<ItemOutcome, SyncError>;

    /// Clean up after a prepared task that will not commit
    async fn abandon(&self, _task: &TransferTask, _plan: &Self::Plan) {}

    async fn complete(&self, _task: &TransferTask, _result: &TransferResult) {}
}

// ============================================================================
// Task state
// ============================================================================

/// Cancellation phases, tracked separately from the public status so that
/// cancel and commit can race safely
mod phase {
    /// Queued, preparing or backing off
    pub const WAITING: u8 = 0;
    /// Running an attempt
    pub const DATA: u8 = 1;
    /// Committing; cannot be cancelled any more
    pub const FINALIZING: u8 = 2;
    pub const CANCELLED: u8 = 3;
}

#[derive(Debug)]
struct TaskState {
    event_id: EventId,
    path: RelativePath,
    direction: TransferDirection,
    status: AtomicU8,
    phase: AtomicU8,
    attempt: AtomicU32,
    bytes: AtomicU64,
    total: AtomicU64,
    cancel: CancellationToken,
}

impl TaskState {
    fn new(task: &TransferTask, cancel: CancellationToken) -> Self {
        Self {
            event_id: task.event_id,
            path: task.path.clone(),
            direction: task.direction,
            status: AtomicU8::new(TransferStatus::Queued.as_u8()),
            phase: AtomicU8::new(phase::WAITING),
            attempt: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
            total: AtomicU64::new(
                task.item.size.filter(|_| !task.item.is_folder).unwrap_or(UNKNOWN_TOTAL),
            ),
            cancel,
        }
    }

    fn status(&self) -> TransferStatus {
        TransferStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: TransferStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `CANCELLED` when `allowed(phase)` holds
    fn cancel_if(&self, allowed: impl Fn(u8) -> bool) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if current == phase::CANCELLED {
                return true;
            }
            if !allowed(current) {
                return false;
            }
            match self.phase.compare_exchange(
                current,
                phase::CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.cancel.cancel();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.phase.load(Ordering::Acquire) == phase::CANCELLED
    }

    fn is_sealed(&self) -> bool {
        self.phase.load(Ordering::Acquire) == phase::FINALIZING
    }

    /// Enter `FINALIZING` from `DATA`, or confirm the task is already there
    fn finalize(&self) -> bool {
        self.transition(phase::DATA, phase::FINALIZING) || self.is_sealed()
    }

    fn snapshot(&self) -> TransferSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        TransferSnapshot {
            event_id: self.event_id,
            path: self.path.clone(),
            direction: self.direction,
            status: self.status(),
            attempt: self.attempt.load(Ordering::Relaxed),
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
            total_bytes: (total != UNKNOWN_TOTAL).then_some(total),
        }
    }
}

/// Handle given to the executor while a task runs
pub struct TaskControl {
    state: Arc<TaskState>,
    call_timeout: Duration,
}

impl TaskControl {
    pub fn event_id(&self) -> EventId {
        self.state.event_id
    }

    pub fn attempt(&self) -> u32 {
        self.state.attempt.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Cancellation point, e.g. between chunks
    ///
    /// # Errors
    /// Returns `SyncError::Cancelled` once the task has been cancelled
    pub fn checkpoint(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn set_total(&self, total: u64) {
        self.state.total.store(total, Ordering::Relaxed);
    }

    /// Pass the point of no return: from here on the task cannot be
    /// cancelled or superseded and a failure is not retried
    ///
    /// # Errors
    /// Returns `SyncError::Cancelled` if the task was cancelled first
    pub fn seal(&self) -> Result<(), SyncError> {
        if self.state.finalize() && !self.state.cancel.is_cancelled() {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }

    /// Record `bytes` more transferred
    pub fn advance(&self, bytes: u64) {
        self.state.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Forget progress, at the start of an attempt
    pub fn reset_progress(&self) {
        self.state.bytes.store(0, Ordering::Relaxed);
    }

    /// Run one call under the per-call timeout, aborting on cancellation
    ///
    /// # Errors
    /// `SyncError::Cancelled` on cancellation, a transport error on timeout,
    /// otherwise whatever `fut` returns
    pub async fn call<T, F>(&self, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        tokio::select! {
            biased;
            _ = self.state.cancel.cancelled() => Err(SyncError::Cancelled),
            res = tokio::time::timeout(self.call_timeout, fut) => {
                res.unwrap_or_else(|_| Err(SyncError::transport("call timed out")))
            }
        }
    }
}

// ============================================================================
// Path queue
// ============================================================================

/// First-come first-served turns per path
///
/// Tickets are issued synchronously at submission, so tasks touching the
/// same path run in submission order however their workers get polled.
#[derive(Debug, Default)]
pub(crate) struct PathQueue {
    next_ticket: AtomicU64,
    tails: Mutex<HashMap<RelativePath, Tail>>,
}

/// Most recent ticket on a path
#[derive(Debug)]
struct Tail {
    ticket: u64,
    released: oneshot::Receiver<()>,
}

impl PathQueue {
    /// Queue behind every earlier ticket on any of `paths`
    ///
    /// All paths are enqueued under one lock, so two multi-path tickets can
    /// never wait on each other.
    pub(crate) fn ticket(self: &Arc<Self>, paths: &[RelativePath]) -> PathTicket {
        let mut sorted: Vec<RelativePath> = paths.to_vec();
        sorted.sort();
        sorted.dedup();

        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut ahead = Vec::new();
        let mut release = Vec::with_capacity(sorted.len());
        {
            let mut tails = self.tails();
            for path in &sorted {
                let (tx, rx) = oneshot::channel();
                let tail = Tail {
                    ticket: id,
                    released: rx,
                };
                if let Some(previous) = tails.insert(path.clone(), tail) {
                    ahead.push(previous.released);
                }
                release.push(tx);
            }
        }

        PathTicket {
            queue: Arc::clone(self),
            id,
            paths: sorted,
            ahead,
            _release: release,
        }
    }

    fn tails(&self) -> MutexGuard<'_, HashMap<RelativePath, Tail>> {
        self.tails.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tails().len()
    }
}

/// A place in the per-path queues; dropping it lets the next ticket in
pub(crate) struct PathTicket {
    queue: Arc<PathQueue>,
    id: u64,
    paths: Vec<RelativePath>,
    ahead: Vec<oneshot::Receiver<()>>,
    _release: Vec<oneshot::Sender<()>>,
}

impl PathTicket {
    /// Wait until every earlier ticket on these paths has been dropped
    ///
    /// Not cancellable: a ticket released before its turn would let the
    /// next one overtake a task that is still running.
    pub(crate) async fn acquire(&mut self) {
        for released in self.ahead.drain(..) {
            // An Err just means the sender was dropped, which is the signal
            let _ = released.await;
        }
    }
}

impl Drop for PathTicket {
    fn drop(&mut self) {
        let mut tails = self.queue.tails();
        for path in &self.paths {
            if tails.get(path).is_some_and(|tail| tail.ticket == self.id) {
                tails.remove(path);
            }
        }
    }
}

// ============================================================================
// TransferScheduler
// ============================================================================

struct Lane {
    workers: Arc<Semaphore>,
    slots: Arc<Semaphore>,
}

impl Lane {
    fn new(concurrency: usize, depth: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(concurrency)),
            slots: Arc::new(Semaphore::new(depth.max(concurrency))),
        }
    }
}

/// Awaitable result of a submitted task
#[derive(Debug)]
pub struct TransferHandle {
    event_id: EventId,
    rx: oneshot::Receiver<TransferResult>,
}

impl TransferHandle {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Wait for the task to reach a terminal state
    pub async fn wait(self) -> TransferResult {
        self.rx.await.unwrap_or(TransferResult::Interrupted)
    }
}

struct Inner<E: TransferExecutor> {
    executor: Arc<E>,
    options: SchedulerOptions,
    upload: Lane,
    download: Lane,
    tasks: DashMap<EventId, Arc<TaskState>>,
    paths: Arc<PathQueue>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Two bounded worker pools with per-path serialization
pub struct TransferScheduler<E: TransferExecutor> {
    inner: Arc<Inner<E>>,
}

impl<E: TransferExecutor> Clone for TransferScheduler<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: TransferExecutor> TransferScheduler<E> {
    pub fn new(executor: Arc<E>, options: SchedulerOptions) -> Self {
        info!(
            upload = options.upload_concurrent,
            download = options.download_concurrent,
            queue_depth = options.queue_depth,
            "Creating transfer scheduler"
        );
        Self {
            inner: Arc::new(Inner {
                executor,
                upload: Lane::new(options.upload_concurrent, options.queue_depth),
                download: Lane::new(options.download_concurrent, options.queue_depth),
                options,
                tasks: DashMap::new(),
                paths: Arc::new(PathQueue::default()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.inner.executor
    }

    /// Queue a task, waiting for a lane slot when the lane is full
    ///
    /// # Errors
    /// Returns `SyncError::Cancelled` once the scheduler is shutting down
    #[instrument(skip(self, task), fields(event_id = %task.event_id, path = %task.path))]
    pub async fn submit(&self, task: TransferTask) -> Result<TransferHandle, SyncError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let lane = inner.lane(task.direction);
        let slot = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return Err(SyncError::Cancelled),
            permit = Arc::clone(&lane.slots).acquire_owned() => {
                permit.map_err(|_| SyncError::Cancelled)?
            }
        };

        let state = Arc::new(TaskState::new(&task, inner.shutdown.child_token()));
        let touched: Vec<RelativePath> = task.item.touched_paths().cloned().collect();
        let ticket = inner.paths.ticket(&touched);
        inner.tasks.insert(task.event_id, Arc::clone(&state));
        debug!(direction = %task.direction, "Task queued");

        let (tx, rx) = oneshot::channel();
        let event_id = task.event_id;
        let worker = Arc::clone(inner);
        inner.tracker.spawn(async move {
            let result = worker.run_task(&task, &state, ticket).await;
            worker.tasks.remove(&task.event_id);
            drop(slot);
            let _ = tx.send(result);
        });

        Ok(TransferHandle { event_id, rx })
    }

    /// Cancel a task unless it is already committing
    pub fn cancel(&self, event_id: EventId) -> bool {
        match self.inner.tasks.get(&event_id) {
            Some(state) => state.cancel_if(|p| p != phase::FINALIZING),
            None => false,
        }
    }

    /// Cancel a task only while that is safe for a superseding change:
    /// queued, backing off, or an upload still transferring data
    pub fn try_cancel(&self, event_id: EventId) -> bool {
        match self.inner.tasks.get(&event_id) {
            Some(state) => {
                let upload = state.direction == TransferDirection::Upload;
                state.cancel_if(|p| p == phase::WAITING || (p == phase::DATA && upload))
            }
            None => false,
        }
    }

    /// Tasks currently queued or running in one lane, oldest first
    pub fn snapshot(&self, direction: TransferDirection) -> Vec<TransferSnapshot> {
        let mut out: Vec<_> = self
            .inner
            .tasks
            .iter()
            .filter(|t| t.direction == direction)
            .map(|t| t.snapshot())
            .collect();
        out.sort_by_key(|s| s.event_id);
        out
    }

    /// Live tasks that touch `path`
    pub fn tasks_for_path(&self, path: &RelativePath) -> Vec<TransferSnapshot> {
        let mut out: Vec<_> = self
            .inner
            .tasks
            .iter()
            .filter(|t| &t.path == path)
            .map(|t| t.snapshot())
            .collect();
        out.sort_by_key(|s| s.event_id);
        out
    }

    pub fn is_idle(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel every queued and running task and wait for all workers
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(tasks = inner.tasks.len(), "Shutting down transfer scheduler");
        inner.shutdown.cancel();
        for task in inner.tasks.iter() {
            task.cancel_if(|p| p != phase::FINALIZING);
        }
        inner.tracker.close();
        inner.tracker.wait().await;
        debug!("Transfer scheduler stopped");
    }
}

impl<E: TransferExecutor> Inner<E> {
    fn lane(&self, direction: TransferDirection) -> &Lane {
        match direction {
            TransferDirection::Upload => &self.upload,
            TransferDirection::Download => &self.download,
        }
    }

    fn stopped(&self) -> TransferResult {
        if self.shutdown.is_cancelled() {
            TransferResult::Interrupted
        } else {
            TransferResult::Cancelled
        }
    }

    async fn run_task(
        &self,
        task: &TransferTask,
        state: &Arc<TaskState>,
        mut ticket: PathTicket,
    ) -> TransferResult {
        ticket.acquire().await;

        let permit = if state.is_cancelled() {
            None
        } else {
            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => None,
                permit = Arc::clone(&self.lane(task.direction).workers).acquire_owned() => permit.ok(),
            }
        };

        let result = match permit {
            Some(permit) if !state.is_cancelled() => self.execute(task, state, permit).await,
            _ => {
                debug!(event_id = %task.event_id, "Task cancelled before start");
                self.stopped()
            }
        };

        state.set_status(match &result {
            TransferResult::Done(_) => TransferStatus::Committed,
            TransferResult::Failed(_) => TransferStatus::Failed,
            TransferResult::Cancelled | TransferResult::Interrupted => TransferStatus::Cancelled,
        });
        self.executor.complete(task, &result).await;
        drop(ticket);
        result
    }

    async fn execute(
        &self,
        task: &TransferTask,
        state: &Arc<TaskState>,
        _permit: OwnedSemaphorePermit,
    ) -> TransferResult {
        state.set_status(TransferStatus::Running);
        let ctl = TaskControl {
            state: Arc::clone(state),
            call_timeout: self.options.call_timeout,
        };

        let plan = match self.executor.prepare(task).await {
            Ok(plan) => plan,
            Err(SyncError::Cancelled) => return self.stopped(),
            Err(e) => {
                warn!(event_id = %task.event_id, error = %e, "Task could not be prepared");
                return TransferResult::Failed(e);
            }
        };

        let output = self.attempt_loop(task, state, &ctl, &plan).await;

        let output = match output {
            Ok(output) if state.finalize() => output,
            Ok(_) | Err(SyncError::Cancelled) => {
                self.executor.abandon(task, &plan).await;
                return self.stopped();
            }
            Err(e) => {
                self.executor.abandon(task, &plan).await;
                return TransferResult::Failed(e);
            }
        };

        match self.executor.commit(task, plan, output).await {
            Ok(outcome) => {
                debug!(event_id = %task.event_id, ?outcome, "Task committed");
                TransferResult::Done(outcome)
            }
            Err(e) => {
                warn!(event_id = %task.event_id, error = %e, "Commit failed");
                TransferResult::Failed(e)
            }
        }
    }

    async fn attempt_loop(
        &self,
        task: &TransferTask,
        state: &Arc<TaskState>,
        ctl: &TaskControl,
        plan: &E::Plan,
    ) -> Result<E::Output, SyncError> {
        let mut attempt = 0u32;
        loop {
            if !state.transition(phase::WAITING, phase::DATA) {
                return Err(SyncError::Cancelled);
            }
            state.attempt.store(attempt, Ordering::Relaxed);

            let res = if attempt > 0 {
                match self.executor.recheck(task, plan, ctl).await {
                    Ok(Some(found)) => {
                        info!(event_id = %task.event_id, "Adopting result of an earlier attempt");
                        Ok(found)
                    }
                    Ok(None) => self.executor.run(task, plan, ctl).await,
                    Err(e) => Err(e),
                }
            } else {
                self.executor.run(task, plan, ctl).await
            };

            match res {
                Ok(output) => return Ok(output),
                Err(e)
                    if e.is_transient()
                        && attempt + 1 < self.options.max_attempts
                        && !state.is_cancelled()
                        && !state.is_sealed() =>
                {
                    let delay = match &e {
                        SyncError::Transport {
                            retry_after: Some(after),
                            ..
                        } => *after,
                        _ => self.options.backoff(attempt),
                    };
                    warn!(
                        event_id = %task.event_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    if !state.transition(phase::DATA, phase::WAITING) {
                        return Err(SyncError::Cancelled);
                    }
                    state.set_status(TransferStatus::Retrying);
                    tokio::select! {
                        biased;
                        _ = state.cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    state.set_status(TransferStatus::Running);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
