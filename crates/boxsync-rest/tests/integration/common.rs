//! Shared test helpers for REST adapter integration tests
//!
//! Each helper starts a wiremock server and returns a RestClient pointing
//! at it, plus the credentials and request context used by every call.

use wiremock::MockServer;

use boxsync_core::domain::{
    newtypes::{DeviceId, SyncboxId},
    Credentials,
};
use boxsync_core::ports::RequestContext;
use boxsync_rest::RestClient;

pub const TOKEN: &str = "test-token";
pub const DEVICE: &str = "device-test-001";
pub const SYNCBOX: i64 = 42;

/// Starts a mock server and returns a (MockServer, RestClient) tuple
pub async fn setup_rest_mock() -> (MockServer, RestClient) {
    let server = MockServer::start().await;
    let client = RestClient::with_base_url(server.uri()).expect("client");
    (server, client)
}

pub fn credentials() -> Credentials {
    Credentials::new("key-1", "secret-1").with_token(TOKEN)
}

pub fn context() -> RequestContext {
    RequestContext {
        device_id: DeviceId::new(DEVICE.to_string()).unwrap(),
        syncbox_id: SyncboxId::new(SYNCBOX),
    }
}

/// JSON body of a server item
pub fn item_json(uid: &str, path: &str, revision: &str) -> serde_json::Value {
    serde_json::json!({
        "uid": uid,
        "path": path,
        "revision": revision,
        "hash": "0123456789abcdef0123456789abcdef",
        "size": 11,
        "is_folder": false,
        "modified_at": "2026-03-01T10:00:00Z"
    })
}
