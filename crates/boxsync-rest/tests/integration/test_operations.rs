//! Integration tests for one-off operations, metadata, change list and quota

use wiremock::{
    matchers::{body_partial_json, header, method, path, query_param},
    Mock, ResponseTemplate,
};

use boxsync_core::domain::newtypes::{Cursor, Digest128, RelativePath, ServerUid};
use boxsync_core::ports::{FileMetadata, IRestClient, RestRequest, RestResponse};

use crate::common;

fn rel(s: &str) -> RelativePath {
    s.parse().unwrap()
}

fn metadata() -> FileMetadata {
    FileMetadata {
        hash: Digest128::from_hex("0123456789abcdef0123456789abcdef").unwrap(),
        size: 11,
        created_at: None,
        modified_at: None,
    }
}

// ============================================================================
// Create / modify / delete / move
// ============================================================================

#[tokio::test]
async fn test_create_file_sends_identity_and_idempotency_headers() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("POST"))
        .and(path("/1/sync/file/add"))
        .and(header("Authorization", "Bearer test-token"))
        .and(header("X-Device-Id", common::DEVICE))
        .and(header("X-Syncbox-Id", "42"))
        .and(header("Idempotency-Key", "idem-1"))
        .and(body_partial_json(serde_json::json!({
            "path": "/docs/a.txt",
            "hash": "0123456789abcdef0123456789abcdef",
            "size": 11
        })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(common::item_json("S1", "/docs/a.txt", "r1")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let request = RestRequest::CreateFile {
        path: rel("docs/a.txt"),
        metadata: metadata(),
        idempotency_key: "idem-1".to_string(),
    };
    let item = client
        .execute(&common::credentials(), &common::context(), &request)
        .await
        .expect("create failed")
        .into_item()
        .unwrap();

    assert_eq!(item.uid.as_str(), "S1");
    assert_eq!(item.path, rel("docs/a.txt"));
    assert_eq!(item.revision.as_deref(), Some("r1"));
    assert_eq!(item.size, 11);
}

#[tokio::test]
async fn test_create_folder() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("POST"))
        .and(path("/1/sync/folder/add"))
        .and(body_partial_json(serde_json::json!({ "path": "/photos" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "uid": "F1",
            "path": "/photos",
            "is_folder": true
        })))
        .mount(&server)
        .await;

    let request = RestRequest::CreateFolder {
        path: rel("photos"),
        idempotency_key: "idem-2".to_string(),
    };
    let item = client
        .execute(&common::credentials(), &common::context(), &request)
        .await
        .unwrap()
        .into_item()
        .unwrap();

    assert!(item.is_folder);
    assert!(item.hash.is_none());
}

#[tokio::test]
async fn test_modify_carries_revision() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("POST"))
        .and(path("/1/sync/file/modify"))
        .and(body_partial_json(serde_json::json!({
            "uid": "S1",
            "revision": "r1"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::item_json("S1", "/a.txt", "r2")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let request = RestRequest::ModifyFile {
        server_uid: ServerUid::new("S1".to_string()).unwrap(),
        path: rel("a.txt"),
        metadata: metadata(),
        revision: Some("r1".to_string()),
    };
    let item = client
        .execute(&common::credentials(), &common::context(), &request)
        .await
        .unwrap()
        .into_item()
        .unwrap();
    assert_eq!(item.revision.as_deref(), Some("r2"));
}

#[tokio::test]
async fn test_delete_folder_uses_folder_endpoint() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("POST"))
        .and(path("/1/sync/folder/delete"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let request = RestRequest::Delete {
        server_uid: ServerUid::new("F1".to_string()).unwrap(),
        path: rel("photos"),
        is_folder: true,
        revision: None,
    };
    let response = client
        .execute(&common::credentials(), &common::context(), &request)
        .await
        .unwrap();
    assert_eq!(response, RestResponse::Removed);
}

#[tokio::test]
async fn test_move_file() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("POST"))
        .and(path("/1/sync/file/move"))
        .and(body_partial_json(serde_json::json!({
            "from": "/a.txt",
            "to": "/b/a.txt"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::item_json("S1", "/b/a.txt", "r3")),
        )
        .mount(&server)
        .await;

    let request = RestRequest::Move {
        server_uid: ServerUid::new("S1".to_string()).unwrap(),
        from: rel("a.txt"),
        to: rel("b/a.txt"),
        is_folder: false,
        revision: Some("r2".to_string()),
    };
    let item = client
        .execute(&common::credentials(), &common::context(), &request)
        .await
        .unwrap()
        .into_item()
        .unwrap();
    assert_eq!(item.path, rel("b/a.txt"));
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_get_metadata_queries_by_path() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/metadata"))
        .and(query_param("path", "/docs/a.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(common::item_json("S1", "/docs/a.txt", "r1")),
        )
        .mount(&server)
        .await;

    let request = RestRequest::GetMetadata {
        path: rel("docs/a.txt"),
    };
    let item = client
        .execute(&common::credentials(), &common::context(), &request)
        .await
        .unwrap()
        .into_item()
        .unwrap();
    assert_eq!(
        item.modified_at.unwrap().to_rfc3339(),
        "2026-03-01T10:00:00+00:00"
    );
}

#[tokio::test]
async fn test_changes_since_cursor() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/changes"))
        .and(query_param("cursor", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                common::item_json("S1", "/a.txt", "r2"),
                { "uid": "S2", "path": "/old.txt", "is_deleted": true }
            ],
            "cursor": "c2",
            "has_more": true
        })))
        .mount(&server)
        .await;

    let request = RestRequest::ChangesSince {
        cursor: Some(Cursor::new("c1".to_string()).unwrap()),
    };
    let page = client
        .execute(&common::credentials(), &common::context(), &request)
        .await
        .unwrap()
        .into_changes()
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert!(page.items[1].is_deleted);
    assert_eq!(page.cursor.as_str(), "c2");
    assert!(page.has_more);
}

#[tokio::test]
async fn test_full_listing_without_cursor() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [],
            "cursor": "c0"
        })))
        .mount(&server)
        .await;

    let page = client
        .execute(
            &common::credentials(),
            &common::context(),
            &RestRequest::ChangesSince { cursor: None },
        )
        .await
        .unwrap()
        .into_changes()
        .unwrap();

    assert!(page.items.is_empty());
    assert!(!page.has_more);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].url.query().is_none());
}

#[tokio::test]
async fn test_get_quota() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/quota"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "usage": 1073741824_u64,
            "limit": 5368709120_u64
        })))
        .mount(&server)
        .await;

    let quota = client
        .execute(
            &common::credentials(),
            &common::context(),
            &RestRequest::GetQuota,
        )
        .await
        .unwrap()
        .into_quota()
        .unwrap();

    assert_eq!(quota.usage_bytes, 1_073_741_824);
    assert_eq!(quota.limit_bytes, 5_368_709_120);
}
