//! Push notification port (driven/secondary port)
//!
//! A push channel is a long-lived subscription to server-side change
//! signals for one `(syncbox, device)` pair. Messages carry no payload the
//! engine relies on; each one only means "something changed, run an
//! incremental pass".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::rest_client::{RequestContext, RestError};
use crate::domain::Credentials;

/// A signal received on the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Server-assigned message kind, e.g. `"change"` or `"keepalive"`
    pub kind: String,
    /// Originating device, used to ignore our own echoes when present
    #[serde(default)]
    pub origin_device: Option<String>,
}

impl PushMessage {
    /// Returns true for messages that should trigger a reconciliation pass
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.kind != "keepalive"
    }
}

/// Port for the server push channel
#[async_trait]
pub trait IPushChannel: Send + Sync {
    /// Open the subscription for `ctx`
    async fn subscribe(
        &self,
        credentials: &Credentials,
        ctx: &RequestContext,
    ) -> Result<(), RestError>;

    /// Wait for the next message on the open subscription
    ///
    /// Any error means the channel is lost and must be re-subscribed.
    async fn next_message(&self) -> Result<PushMessage, RestError>;

    /// Close the subscription; a no-op when not subscribed
    async fn unsubscribe(&self);
}
