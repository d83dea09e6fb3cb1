//! Quota tracker
//!
//! Single writer for [`QuotaState`]. Readings come from the quota endpoint,
//! periodically and after every commit that changed the server's content.
//! Only a flip of the `exceeded` flag publishes an event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use boxsync_core::domain::{EngineEvent, QuotaState, QuotaTransition};
use boxsync_core::ports::{ILocalIndex, IRestClient, RequestContext, RestRequest};

use crate::credentials::CredentialGuard;
use crate::SyncError;

pub struct QuotaTracker {
    state: Mutex<QuotaState>,
    index: Arc<dyn ILocalIndex>,
    events: broadcast::Sender<EngineEvent>,
}

impl QuotaTracker {
    pub fn new(index: Arc<dyn ILocalIndex>, events: broadcast::Sender<EngineEvent>) -> Self {
        Self {
            state: Mutex::new(QuotaState::default()),
            index,
            events,
        }
    }

    /// Build a tracker seeded with the usage persisted in the index
    ///
    /// # Errors
    /// Returns an error if the quota partition cannot be read
    pub async fn restore(
        index: Arc<dyn ILocalIndex>,
        events: broadcast::Sender<EngineEvent>,
    ) -> anyhow::Result<Self> {
        let state = index.load_quota().await?.unwrap_or_default();
        debug!(
            usage = state.usage_bytes,
            limit = state.limit_bytes,
            exceeded = state.exceeded,
            "Restored quota state"
        );
        Ok(Self {
            state: Mutex::new(state),
            index,
            events,
        })
    }

    pub async fn state(&self) -> QuotaState {
        *self.state.lock().await
    }

    /// Apply a usage reading
    ///
    /// The state is persisted on every reading; `QuotaExceeded` or
    /// `QuotaReturnedNormal` is published only when `exceeded` flips.
    #[instrument(skip(self))]
    pub async fn update(&self, usage_bytes: u64, limit_bytes: u64) -> Option<QuotaTransition> {
        let mut state = self.state.lock().await;
        let transition = state.apply(usage_bytes, limit_bytes);

        if let Err(e) = self.index.save_quota(&state).await {
            warn!(error = %e, "Failed to persist quota usage");
        }

        match transition {
            Some(QuotaTransition::Exceeded) => {
                info!(usage_bytes, limit_bytes, "Quota exceeded");
                let _ = self.events.send(EngineEvent::QuotaExceeded {
                    usage_bytes,
                    limit_bytes,
                });
            }
            Some(QuotaTransition::ReturnedNormal) => {
                info!(usage_bytes, limit_bytes, "Quota returned to normal");
                let _ = self.events.send(EngineEvent::QuotaReturnedNormal {
                    usage_bytes,
                    limit_bytes,
                });
            }
            None => {}
        }
        transition
    }

    /// Fetch a reading from the quota endpoint and apply it
    ///
    /// # Errors
    /// Returns the classified server error
    pub async fn refresh(
        &self,
        rest: &dyn IRestClient,
        guard: &CredentialGuard,
        ctx: &RequestContext,
    ) -> Result<(), SyncError> {
        let reading = guard
            .with_credentials(|creds| async move {
                rest.execute(&creds, ctx, &RestRequest::GetQuota)
                    .await?
                    .into_quota()
            })
            .await?;
        self.update(reading.usage_bytes, reading.limit_bytes).await;
        Ok(())
    }
}

/// Refresh the tracker every `interval` until `cancel` fires
pub async fn run_quota_loop(
    tracker: Arc<QuotaTracker>,
    rest: Arc<dyn IRestClient>,
    guard: CredentialGuard,
    ctx: RequestContext,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = tracker.refresh(rest.as_ref(), &guard, &ctx).await {
                    warn!(error = %e, "Quota refresh failed");
                }
            }
        }
    }
    debug!("Quota loop stopped");
}
