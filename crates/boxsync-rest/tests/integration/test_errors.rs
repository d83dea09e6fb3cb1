//! Integration tests for HTTP status to error mapping

use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use boxsync_core::ports::{IRestClient, RestError, RestRequest};

use crate::common;

async fn quota_with_status(template: ResponseTemplate) -> RestError {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/quota"))
        .respond_with(template)
        .mount(&server)
        .await;

    client
        .execute(
            &common::credentials(),
            &common::context(),
            &RestRequest::GetQuota,
        )
        .await
        .expect_err("request should fail")
}

#[tokio::test]
async fn test_401_maps_to_unauthorized() {
    let err = quota_with_status(
        ResponseTemplate::new(401).set_body_json(serde_json::json!({ "error": "token expired" })),
    )
    .await;
    assert_eq!(err, RestError::Unauthorized("token expired".to_string()));
    assert!(err.is_auth());
}

#[tokio::test]
async fn test_409_maps_to_conflict_with_revision() {
    let err = quota_with_status(ResponseTemplate::new(409).set_body_json(serde_json::json!({
        "error": "revision mismatch",
        "current_revision": "r7"
    })))
    .await;
    match err {
        RestError::Conflict {
            message,
            current_revision,
        } => {
            assert_eq!(message, "revision mismatch");
            assert_eq!(current_revision.as_deref(), Some("r7"));
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_404_maps_to_not_found() {
    let err = quota_with_status(ResponseTemplate::new(404)).await;
    assert!(matches!(err, RestError::NotFound(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_429_honors_retry_after() {
    let err = quota_with_status(ResponseTemplate::new(429).insert_header("Retry-After", "3")).await;
    assert_eq!(err, RestError::RateLimited { retry_after: 3 });
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_5xx_maps_to_transport() {
    let err = quota_with_status(ResponseTemplate::new(503)).await;
    assert!(matches!(err, RestError::Transport(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_other_4xx_maps_to_rejected() {
    let err = quota_with_status(ResponseTemplate::new(422)).await;
    assert!(matches!(err, RestError::Rejected { status: 422, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_undecodable_body_maps_to_invalid_response() {
    let err = quota_with_status(ResponseTemplate::new(200).set_body_string("not json")).await;
    assert!(matches!(err, RestError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_connection_refused_maps_to_transport() {
    let server = wiremock::MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let client = boxsync_rest::RestClient::with_base_url(uri).unwrap();
    let err = client
        .execute(
            &common::credentials(),
            &common::context(),
            &RestRequest::GetQuota,
        )
        .await
        .expect_err("server is gone");
    assert!(matches!(err, RestError::Transport(_)));
}
