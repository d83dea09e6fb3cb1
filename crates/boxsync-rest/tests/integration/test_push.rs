//! Integration tests for the long-poll push channel

use std::time::Duration;

use wiremock::{
    matchers::{method, path, query_param},
    Mock, ResponseTemplate,
};

use boxsync_core::ports::{IPushChannel, RestError};
use boxsync_rest::LongPollPushChannel;

use crate::common;

#[tokio::test]
async fn test_next_message_requires_subscription() {
    let (_server, client) = common::setup_rest_mock().await;
    let channel = LongPollPushChannel::new(client);

    let err = channel.next_message().await.unwrap_err();
    assert!(matches!(err, RestError::Transport(_)));
}

#[tokio::test]
async fn test_subscribe_then_receive_batch_in_order() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/notifications"))
        .and(query_param("timeout", "0"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1/sync/notifications"))
        .and(query_param("timeout", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [
                { "kind": "change", "origin_device": "other-device" },
                { "kind": "keepalive" }
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let channel = LongPollPushChannel::new(client).with_poll_timeout(Duration::from_secs(1));
    channel
        .subscribe(&common::credentials(), &common::context())
        .await
        .unwrap();
    assert!(channel.is_subscribed().await);

    let first = channel.next_message().await.unwrap();
    assert!(first.is_change());
    assert_eq!(first.origin_device.as_deref(), Some("other-device"));

    let second = channel.next_message().await.unwrap();
    assert!(!second.is_change());

    channel.unsubscribe().await;
    assert!(!channel.is_subscribed().await);
}

#[tokio::test]
async fn test_quiet_window_yields_keepalive() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/notifications"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let channel = LongPollPushChannel::new(client).with_poll_timeout(Duration::from_secs(1));
    channel
        .subscribe(&common::credentials(), &common::context())
        .await
        .unwrap();

    let msg = channel.next_message().await.unwrap();
    assert_eq!(msg.kind, "keepalive");
}

#[tokio::test]
async fn test_subscribe_with_bad_credentials_fails() {
    let (server, client) = common::setup_rest_mock().await;

    Mock::given(method("GET"))
        .and(path("/1/sync/notifications"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let channel = LongPollPushChannel::new(client);
    let err = channel
        .subscribe(&common::credentials(), &common::context())
        .await
        .unwrap_err();
    assert!(err.is_auth());
    assert!(!channel.is_subscribed().await);
}
