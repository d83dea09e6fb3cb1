//! Integration tests for boxsync-rest
//!
//! Uses wiremock to simulate the sync server and verifies request shapes,
//! response decoding and status-code mapping of the RestClient and the
//! long-poll push channel.

mod common;

mod test_content;
mod test_errors;
mod test_operations;
mod test_push;
