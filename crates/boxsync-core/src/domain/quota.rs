//! Quota state
//!
//! The transition logic lives here so it can be tested without any locking;
//! the tracker in `boxsync-sync` owns the single writer.

use serde::{Deserialize, Serialize};

/// Storage usage of the syncbox's plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub usage_bytes: u64,
    pub limit_bytes: u64,
    pub exceeded: bool,
}

/// A change of the `exceeded` flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTransition {
    /// false -> true
    Exceeded,
    /// true -> false
    ReturnedNormal,
}

impl QuotaState {
    /// Whether `usage` is over a (non-zero) `limit`
    #[must_use]
    pub fn is_over(usage: u64, limit: u64) -> bool {
        limit > 0 && usage >= limit
    }

    /// Apply a new usage reading and report a flip of `exceeded`, if any
    pub fn apply(&mut self, usage: u64, limit: u64) -> Option<QuotaTransition> {
        let exceeded = Self::is_over(usage, limit);
        let previous = self.exceeded;

        self.usage_bytes = usage;
        self.limit_bytes = limit;
        self.exceeded = exceeded;

        match (previous, exceeded) {
            (false, true) => Some(QuotaTransition::Exceeded),
            (true, false) => Some(QuotaTransition::ReturnedNormal),
            _ => None,
        }
    }
}
