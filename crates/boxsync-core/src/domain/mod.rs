//! Domain entities
//!
//! This module contains the core domain types for boxsync:
//! - Newtypes for identifiers, paths and digests
//! - The change model flowing through the sync pipeline
//! - Local index records and commits
//! - Transfer task types and snapshots
//! - Quota state, engine status and events
//! - Domain-specific error types

pub mod change;
pub mod credentials;
pub mod errors;
pub mod index;
pub mod newtypes;
pub mod quota;
pub mod status;
pub mod transfer;

// Re-export commonly used types
pub use change::{ChangeKind, ChangeModel, Direction};
pub use credentials::Credentials;
pub use errors::DomainError;
pub use index::{EventRecord, EventStatus, IndexCommit, IndexEntry};
pub use newtypes::*;
pub use quota::{QuotaState, QuotaTransition};
pub use status::{EngineEvent, EngineState, ItemOutcome, SyncMode, SyncStatus};
pub use transfer::{TransferDirection, TransferSnapshot, TransferStatus, TransferTask};
