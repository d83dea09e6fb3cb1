//! Integration tests for chunked content upload and download

use wiremock::{
    matchers::{header, method, path},
    Mock, ResponseTemplate,
};

use boxsync_core::domain::newtypes::ServerUid;
use boxsync_core::ports::{IRestClient, RestError, UploadChunk};

use crate::common;

fn uid(s: &str) -> ServerUid {
    ServerUid::new(s.to_string()).unwrap()
}

// ============================================================================
// Upload
// ============================================================================

#[tokio::test]
async fn test_upload_chunk_sends_content_range() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("PUT"))
        .and(path("/1/sync/content/S1"))
        .and(header("Content-Range", "bytes 4-7/10"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let chunk = UploadChunk {
        server_uid: uid("S1"),
        offset: 4,
        total_size: 10,
        data: b"abcd".to_vec(),
    };
    client
        .upload_chunk(&common::credentials(), &common::context(), &chunk)
        .await
        .expect("upload failed");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].body, b"abcd");
}

#[tokio::test]
async fn test_upload_empty_file() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("PUT"))
        .and(path("/1/sync/content/S2"))
        .and(header("Content-Range", "bytes */0"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let chunk = UploadChunk {
        server_uid: uid("S2"),
        offset: 0,
        total_size: 0,
        data: Vec::new(),
    };
    client
        .upload_chunk(&common::credentials(), &common::context(), &chunk)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_upload_chunk_conflict() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("PUT"))
        .and(path("/1/sync/content/S1"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let chunk = UploadChunk {
        server_uid: uid("S1"),
        offset: 0,
        total_size: 1,
        data: vec![1],
    };
    let err = client
        .upload_chunk(&common::credentials(), &common::context(), &chunk)
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::Conflict { .. }));
}

// ============================================================================
// Download
// ============================================================================

#[tokio::test]
async fn test_download_partial_content() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/content/S1"))
        .and(header("Range", "bytes=0-4"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"Hello".to_vec()))
        .mount(&server)
        .await;

    let data = client
        .download_chunk(&common::credentials(), &common::context(), &uid("S1"), 0, 5)
        .await
        .unwrap();
    assert_eq!(data, b"Hello");
}

#[tokio::test]
async fn test_download_full_body_is_sliced() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/content/S1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"Hello, world".to_vec()))
        .mount(&server)
        .await;

    let data = client
        .download_chunk(&common::credentials(), &common::context(), &uid("S1"), 7, 5)
        .await
        .unwrap();
    assert_eq!(data, b"world");
}

#[tokio::test]
async fn test_download_past_end_returns_empty() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/content/S1"))
        .respond_with(ResponseTemplate::new(416))
        .mount(&server)
        .await;

    let data = client
        .download_chunk(&common::credentials(), &common::context(), &uid("S1"), 12, 5)
        .await
        .unwrap();
    assert!(data.is_empty());
}
