//! Credential refresh port
//!
//! Implemented by the facade. Called at most once per expiry episode.

use async_trait::async_trait;

use crate::domain::Credentials;

/// Supplies fresh credentials after the server rejected the current ones
#[async_trait]
pub trait ICredentialRefresher: Send + Sync {
    /// Return replacement credentials, or `None` when none are available
    ///
    /// # Errors
    /// Any error is treated like `None`: the refresh failed.
    async fn refresh(&self, current: &Credentials) -> anyhow::Result<Option<Credentials>>;
}
