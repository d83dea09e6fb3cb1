//! Push notification supervisor
//!
//! Keeps one push subscription per syncbox alive and turns every signal
//! into an incremental reconciliation pass.
//!
//! ## State machine
//!
//! ```text
//!                   subscribe ok
//! Disconnected ──► Connecting ──────────► Connected
//!      ▲               │  ▲                  │
//!      │     fail      │  │ backoff elapsed  │ channel lost
//!      │               ▼  │                  ▼
//!      └─ shutdown ── Degraded (polling) ◄───┘
//! ```
//!
//! While degraded the supervisor polls every `poll_interval` and retries
//! the subscription with exponential backoff. A push failure and a poll
//! failure in the same cycle are reported as one `PushNotificationError`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use boxsync_core::config::NotificationConfig;
use boxsync_core::domain::EngineEvent;
use boxsync_core::ports::{IPushChannel, PushMessage, RequestContext};

use crate::credentials::CredentialGuard;
use crate::SyncError;

/// Connection state of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
    /// Push unavailable; polling
    Degraded,
}

/// Receiver of "something changed on the server" signals
#[async_trait]
pub trait RemoteSignalSink: Send + Sync {
    /// Run one incremental pass; returns the number of divergences found
    async fn remote_signal(&self) -> Result<usize, SyncError>;
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub push_enabled: bool,
    pub poll_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl SupervisorOptions {
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.reconnect_max)
            .min(self.reconnect_max)
    }
}

impl From<&NotificationConfig> for SupervisorOptions {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            push_enabled: config.push_enabled,
            poll_interval: config.poll_interval(),
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
        }
    }
}

/// Why the connected phase ended
enum Disconnect {
    Lost(String),
    Shutdown,
}

pub struct NotificationSupervisor {
    channel: Arc<dyn IPushChannel>,
    guard: CredentialGuard,
    ctx: RequestContext,
    sink: Arc<dyn RemoteSignalSink>,
    events: broadcast::Sender<EngineEvent>,
    options: SupervisorOptions,
    state: watch::Sender<SupervisorState>,
}

impl NotificationSupervisor {
    pub fn new(
        channel: Arc<dyn IPushChannel>,
        guard: CredentialGuard,
        ctx: RequestContext,
        sink: Arc<dyn RemoteSignalSink>,
        events: broadcast::Sender<EngineEvent>,
        options: SupervisorOptions,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            channel,
            guard,
            ctx,
            sink,
            events,
            options,
            state,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Supervisor state changed");
        }
    }

    /// Run until `cancel` fires, then unsubscribe
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            syncbox = %self.ctx.syncbox_id,
            push = self.options.push_enabled,
            "Notification supervisor starting"
        );
        let mut attempt = 0u32;

        'supervise: loop {
            let mut push_error = None;

            if self.options.push_enabled {
                self.set_state(SupervisorState::Connecting);
                match self.subscribe(&cancel).await {
                    Ok(true) => {
                        self.set_state(SupervisorState::Connected);
                        attempt = 0;
                        // Catch up on whatever happened while disconnected
                        if !self.signal(&cancel).await {
                            break 'supervise;
                        }
                        match self.listen(&cancel).await {
                            Disconnect::Shutdown => break 'supervise,
                            Disconnect::Lost(reason) => {
                                warn!(reason = %reason, "Push channel lost");
                                push_error = Some(reason);
                            }
                        }
                        self.channel.unsubscribe().await;
                    }
                    Ok(false) => break 'supervise,
                    Err(e) => {
                        warn!(error = %e, attempt, "Push subscription failed");
                        push_error = Some(e.to_string());
                    }
                }
            }

            self.set_state(SupervisorState::Degraded);
            let reconnect_at = self
                .options
                .push_enabled
                .then(|| Instant::now() + self.options.reconnect_delay(attempt));
            attempt = attempt.saturating_add(1);

            loop {
                let Some(poll) = self.pass(&cancel).await else {
                    break 'supervise;
                };
                let poll_error = poll.err().map(|e| e.to_string());
                if push_error.is_some() || poll_error.is_some() {
                    let _ = self.events.send(EngineEvent::PushNotificationError {
                        push: push_error.take(),
                        poll: poll_error,
                    });
                }

                let next_poll = Instant::now() + self.options.poll_interval;
                let wake = match reconnect_at {
                    Some(at) if at < next_poll => at,
                    _ => next_poll,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'supervise,
                    _ = tokio::time::sleep_until(wake) => {}
                }
                if reconnect_at.is_some_and(|at| Instant::now() >= at) {
                    debug!("Retrying push subscription");
                    break;
                }
            }
        }

        self.channel.unsubscribe().await;
        self.set_state(SupervisorState::Disconnected);
        info!("Notification supervisor stopped");
    }

    /// Returns `Ok(false)` when cancelled while subscribing
    async fn subscribe(&self, cancel: &CancellationToken) -> Result<bool, SyncError> {
        let channel = &self.channel;
        let ctx = &self.ctx;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(false),
            res = self.guard.with_credentials(|creds| async move {
                channel.subscribe(&creds, ctx).await
            }) => res.map(|_| true),
        }
    }

    async fn listen(&self, cancel: &CancellationToken) -> Disconnect {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Disconnect::Shutdown,
                msg = self.channel.next_message() => msg,
            };
            match message {
                Ok(msg) if self.is_foreign_change(&msg) => {
                    if !self.signal(cancel).await {
                        return Disconnect::Shutdown;
                    }
                }
                Ok(msg) => debug!(kind = %msg.kind, "Ignoring push message"),
                Err(e) => return Disconnect::Lost(e.to_string()),
            }
        }
    }

    fn is_foreign_change(&self, msg: &PushMessage) -> bool {
        msg.is_change() && msg.origin_device.as_deref() != Some(self.ctx.device_id.as_str())
    }

    /// One remote pass; `None` when `cancel` fired first
    async fn pass(&self, cancel: &CancellationToken) -> Option<Result<usize, SyncError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.sink.remote_signal() => Some(res),
        }
    }

    /// Returns `false` when cancelled mid-pass
    async fn signal(&self, cancel: &CancellationToken) -> bool {
        match self.pass(cancel).await {
            Some(Ok(n)) => debug!(divergences = n, "Remote pass complete"),
            Some(Err(e)) => warn!(error = %e, "Remote pass failed"),
            None => return false,
        }
        true
    }
}
