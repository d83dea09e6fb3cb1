//! boxsync Core - Domain types, ports and configuration
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `ChangeModel`, `IndexEntry`, `EventRecord`, `QuotaState`,
//!   transfer snapshots and engine status/events
//! - **Port definitions** - Traits for adapters: `IRestClient`, `IPushChannel`,
//!   `ICredentialRefresher`, `ILocalIndex`, `ILocalFileSystem`
//! - **Configuration** - The validated YAML configuration consumed by the engine
//!
//! # Architecture
//!
//! The domain module contains pure data and validation with no I/O.
//! Ports define trait interfaces that adapter crates implement
//! (`boxsync-cache`, `boxsync-rest`, `boxsync-sync`).

pub mod config;
pub mod domain;
pub mod ports;
