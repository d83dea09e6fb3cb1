//! Credential guard
//!
//! Every server call goes through [`CredentialGuard::with_credentials`].
//! When the server rejects the current credentials the guard opens a
//! refresh *episode*:
//!
//! ```text
//! call ──401──► open episode ──► refresher.refresh() (once)
//!                   ▲                    │
//! later calls ──────┘ (suspended)        ├─ Some(creds) ─► install, replay waiters by seq
//!                                        └─ None / Err ──► fail every waiter, same error
//! ```
//!
//! The episode closes as soon as new credentials are installed; calls made
//! after that use them directly. Calls suspended during the episode are
//! replayed one at a time in submission order. A call takes part in at
//! most one refresh: a rejection after its replay is terminal.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use boxsync_core::domain::Credentials;
use boxsync_core::ports::{ICredentialRefresher, RestError};

use crate::SyncError;

/// Permission for a suspended call to replay with fresh credentials
struct Grant {
    credentials: Credentials,
    /// Dropped or signalled when the replay finished
    done: oneshot::Sender<()>,
}

type Waiter = oneshot::Sender<Result<Grant, SyncError>>;

/// One refresh cycle: the calls waiting on it, keyed by submission order
#[derive(Default)]
struct Episode {
    waiters: BTreeMap<u64, Waiter>,
}

struct GuardState {
    credentials: Credentials,
    /// Bumped whenever new credentials are installed
    epoch: u64,
    episode: Option<Episode>,
}

struct Inner {
    refresher: Arc<dyn ICredentialRefresher>,
    state: Mutex<GuardState>,
    next_seq: AtomicU64,
    refreshes: AtomicU64,
}

/// Serializes credential refreshes and replays rejected calls
#[derive(Clone)]
pub struct CredentialGuard {
    inner: Arc<Inner>,
}

impl CredentialGuard {
    pub fn new(credentials: Credentials, refresher: Arc<dyn ICredentialRefresher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                state: Mutex::new(GuardState {
                    credentials,
                    epoch: 0,
                    episode: None,
                }),
                next_seq: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// The credentials new calls will use
    pub async fn current(&self) -> Credentials {
        self.inner.state.lock().await.credentials.clone()
    }

    /// Replace the credentials from outside an episode
    pub async fn install(&self, credentials: Credentials) {
        let mut state = self.inner.state.lock().await;
        state.credentials = credentials;
        state.epoch += 1;
    }

    /// Number of calls suspended on the open episode
    pub async fn waiting(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .episode
            .as_ref()
            .map_or(0, |e| e.waiters.len())
    }

    /// How many times the refresher has been invoked
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    /// Run `call` with the current credentials, refreshing them once if
    /// the server rejects them
    ///
    /// # Errors
    /// `SyncError::Auth` when refreshing fails or the replayed call is
    /// rejected again; other server errors are mapped through
    /// `From<RestError>`
    pub async fn with_credentials<T, F, Fut>(&self, call: F) -> Result<T, SyncError>
    where
        F: Fn(Credentials) -> Fut,
        Fut: Future<Output = Result<T, RestError>>,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);

        let (credentials, epoch) = {
            let mut state = self.inner.state.lock().await;
            match state.episode.as_mut() {
                Some(episode) => {
                    let rx = Self::enqueue(episode, seq);
                    drop(state);
                    debug!(seq, "Call suspended on credential refresh");
                    return Self::replay(rx, &call).await;
                }
                None => (state.credentials.clone(), state.epoch),
            }
        };

        let rejected = match call(credentials).await {
            Err(RestError::Unauthorized(msg)) => msg,
            other => return other.map_err(SyncError::from),
        };
        debug!(seq, reason = %rejected, "Credentials rejected");

        let mut state = self.inner.state.lock().await;
        if let Some(episode) = state.episode.as_mut() {
            let rx = Self::enqueue(episode, seq);
            drop(state);
            return Self::replay(rx, &call).await;
        }
        if state.epoch != epoch {
            // Refreshed while this call was in flight; that refresh counts
            let credentials = state.credentials.clone();
            drop(state);
            return Self::after_refresh(call(credentials).await);
        }

        let mut episode = Episode::default();
        let rx = Self::enqueue(&mut episode, seq);
        state.episode = Some(episode);
        let current = state.credentials.clone();
        drop(state);

        info!(seq, "Opening credential refresh episode");
        tokio::spawn(Self::drive_episode(Arc::clone(&self.inner), current));
        Self::replay(rx, &call).await
    }

    fn enqueue(episode: &mut Episode, seq: u64) -> oneshot::Receiver<Result<Grant, SyncError>> {
        let (tx, rx) = oneshot::channel();
        episode.waiters.insert(seq, tx);
        rx
    }

    async fn replay<T, F, Fut>(
        rx: oneshot::Receiver<Result<Grant, SyncError>>,
        call: &F,
    ) -> Result<T, SyncError>
    where
        F: Fn(Credentials) -> Fut,
        Fut: Future<Output = Result<T, RestError>>,
    {
        match rx.await {
            Ok(Ok(grant)) => {
                let result = call(grant.credentials).await;
                let _ = grant.done.send(());
                Self::after_refresh(result)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Auth(
                "credential refresh was abandoned".to_string(),
            )),
        }
    }

    fn after_refresh<T>(result: Result<T, RestError>) -> Result<T, SyncError> {
        result.map_err(|e| match e {
            RestError::Unauthorized(msg) => {
                SyncError::Auth(format!("credentials rejected after refresh: {msg}"))
            }
            other => other.into(),
        })
    }

    /// Refresh once, then release the suspended calls one after another
    async fn drive_episode(inner: Arc<Inner>, current: Credentials) {
        inner.refreshes.fetch_add(1, Ordering::Relaxed);
        let refreshed = match inner.refresher.refresh(&current).await {
            Ok(Some(credentials)) => Ok(credentials),
            Ok(None) => Err("no credentials available".to_string()),
            Err(e) => Err(format!("{e:#}")),
        };

        let credentials = match refreshed {
            Ok(credentials) => credentials,
            Err(reason) => {
                warn!(reason = %reason, "Credential refresh failed");
                let error = SyncError::Auth(format!("credential refresh failed: {reason}"));
                let waiters = {
                    let mut state = inner.state.lock().await;
                    state.episode.take().unwrap_or_default().waiters
                };
                for (_, waiter) in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                return;
            }
        };

        // Close the episode as the credentials are installed: later calls
        // go straight to the server, only the suspended ones replay
        let waiters = {
            let mut state = inner.state.lock().await;
            state.credentials = credentials.clone();
            state.epoch += 1;
            state.episode.take().unwrap_or_default().waiters
        };
        info!(suspended = waiters.len(), "Installed refreshed credentials");

        for (seq, waiter) in waiters {
            let (done_tx, done_rx) = oneshot::channel();
            let grant = Grant {
                credentials: credentials.clone(),
                done: done_tx,
            };
            if waiter.send(Ok(grant)).is_ok() {
                let _ = done_rx.await;
                debug!(seq, "Replayed suspended call");
            }
        }
        debug!("Credential refresh episode closed");
    }
}
