//! boxsync REST - Sync server adapter
//!
//! Provides the async client for:
//! - One-off create/modify/delete/move operations
//! - Metadata lookups and the change list
//! - Quota readings
//! - Chunked content upload and download
//! - The long-poll push notification channel
//!
//! ## Modules
//!
//! - [`client`] - HTTP client implementing `IRestClient`
//! - [`push`] - Long-poll implementation of `IPushChannel`
//!
//! Wire types are private to this crate; every response is validated and
//! converted into `boxsync-core` domain types before it leaves.

pub mod client;
mod dto;
pub mod push;

pub use client::RestClient;
pub use push::LongPollPushChannel;
