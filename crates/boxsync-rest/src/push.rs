//! Long-poll push channel
//!
//! Implements [`IPushChannel`] on top of `GET /1/sync/notifications`. Each
//! `next_message` call holds one long-poll request open for up to
//! `poll_timeout`; the server answers with a batch of messages or with
//! `204 No Content` when the window closed quietly, which is surfaced as a
//! keepalive.
//!
//! ```text
//!   subscribe ──► session stored
//!   next_message ──► buffered? ── yes ──► pop
//!                        │ no
//!                        ▼
//!                  GET /1/sync/notifications?timeout=N
//!                        │
//!              204 ──► keepalive     200 ──► buffer batch, pop first
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use boxsync_core::domain::Credentials;
use boxsync_core::ports::{IPushChannel, PushMessage, RequestContext, RestError};

use crate::client::RestClient;
use crate::dto::NotificationDto;

/// Default long-poll window
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time allowed on top of the poll window before the HTTP request
/// itself times out
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct NotificationBatch {
    #[serde(default)]
    messages: Vec<NotificationDto>,
}

struct Session {
    credentials: Credentials,
    ctx: RequestContext,
    buffered: VecDeque<PushMessage>,
}

/// Push channel backed by HTTP long polling
pub struct LongPollPushChannel {
    client: RestClient,
    poll_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl LongPollPushChannel {
    pub fn new(client: RestClient) -> Self {
        Self {
            client,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            session: Mutex::new(None),
        }
    }

    /// Overrides the long-poll window
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Returns true while a subscription is open
    pub async fn is_subscribed(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

#[async_trait]
impl IPushChannel for LongPollPushChannel {
    #[instrument(skip(self, credentials, ctx), fields(syncbox = %ctx.syncbox_id))]
    async fn subscribe(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
    ) -> Result<(), RestError> {
        // A zero-wait poll validates credentials and identity up front
        let builder = self
            .client
            .request(Method::GET, "/1/sync/notifications", credentials, ctx)
            .query(&[("timeout", "0")]);
        let response = self.client.send(builder).await?;

        let mut buffered = VecDeque::new();
        if response.status() != StatusCode::NO_CONTENT {
            let batch: NotificationBatch = RestClient::json(response).await?;
            buffered.extend(batch.messages.into_iter().map(to_message));
        }

        *self.session.lock().await = Some(Session {
            credentials: credentials.clone(),
            ctx: ctx.clone(),
            buffered,
        });
        debug!("Push channel subscribed");
        Ok(())
    }

    async fn next_message(&self) -> Result<PushMessage, RestError> {
        let (credentials, ctx) = {
            let mut guard = self.session.lock().await;
            let session = guard
                .as_mut()
                .ok_or_else(|| RestError::Transport("push channel is not subscribed".into()))?;
            if let Some(msg) = session.buffered.pop_front() {
                return Ok(msg);
            }
            (session.credentials.clone(), session.ctx.clone())
        };

        let builder = self
            .client
            .request(Method::GET, "/1/sync/notifications", &credentials, &ctx)
            .query(&[("timeout", self.poll_timeout.as_secs().to_string())])
            .timeout(self.poll_timeout + POLL_GRACE);
        let response = self.client.send(builder).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(keepalive());
        }

        let batch: NotificationBatch = RestClient::json(response).await?;
        let mut messages = batch.messages.into_iter().map(to_message);
        let first = messages.next().unwrap_or_else(keepalive);

        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            session.buffered.extend(messages);
        }
        Ok(first)
    }

    async fn unsubscribe(&self) {
        if self.session.lock().await.take().is_some() {
            debug!("Push channel unsubscribed");
        }
    }
}

fn to_message(dto: NotificationDto) -> PushMessage {
    PushMessage {
        kind: dto.kind,
        origin_device: dto.origin_device,
    }
}

fn keepalive() -> PushMessage {
    PushMessage {
        kind: "keepalive".to_string(),
        origin_device: None,
    }
}
