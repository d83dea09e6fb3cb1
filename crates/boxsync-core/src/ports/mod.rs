//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! engine. Implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRestClient`] - Server one-off operations, change list, quota, content
//! - [`IPushChannel`] - Server push notifications
//! - [`ICredentialRefresher`] - External credential refresh callback
//! - [`ILocalIndex`] - Durable last-agreed state and event log
//! - [`ILocalFileSystem`] - Local filesystem operations inside the sync root

pub mod credential_refresher;
pub mod local_filesystem;
pub mod local_index;
pub mod push_channel;
pub mod rest_client;

pub use credential_refresher::ICredentialRefresher;
pub use local_filesystem::{FileSystemState, ILocalFileSystem};
pub use local_index::ILocalIndex;
pub use push_channel::{IPushChannel, PushMessage};
pub use rest_client::{
    ChangePage, FileMetadata, IRestClient, QuotaReading, RequestContext, RestError,
    RestRequest, RestResponse, ServerItem, UploadChunk,
};
