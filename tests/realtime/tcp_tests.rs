//! Binary TCP protocol over a real loopback socket

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use realtime_server::presentation::realtime::payloads::{
    AuthPayload, PublishPayload, TopicPayload,
};
use realtime_server::presentation::tcp::{Frame, TcpMessage};

use crate::common::{eventually, test_settings, token_for, TcpClient, TestApp};

fn subscribe(topic: &str) -> TcpMessage {
    TcpMessage::Subscribe(TopicPayload {
        topic: topic.to_string(),
    })
}

fn publish(topic: &str, data: serde_json::Value) -> TcpMessage {
    TcpMessage::Message(PublishPayload {
        topic: topic.to_string(),
        data,
        metadata: None,
    })
}

fn expect_error(message: TcpMessage, code: &str) {
    match message {
        TcpMessage::Error(payload) => assert_eq!(payload.code, code),
        other => panic!("Expected {} error, got {:?}", code, other),
    }
}

#[tokio::test]
async fn test_publish_reaches_pattern_subscriber() {
    let app = TestApp::spawn().await;
    let mut alice = TcpClient::connect(app.tcp_addr).await;
    let mut bob = TcpClient::connect(app.tcp_addr).await;
    alice.authenticate(1).await;
    bob.authenticate(2).await;

    alice.send(&subscribe("chat.*")).await;
    match alice.recv().await {
        TcpMessage::Subscribed(ack) => assert_eq!(ack.topic, "chat.*"),
        other => panic!("Expected subscribed, got {:?}", other),
    }

    bob.send(&publish("chat.lobby", json!({"text": "hello"}))).await;

    match alice.recv().await {
        TcpMessage::ServerMessage(envelope) => {
            assert_eq!(envelope.topic, "chat.lobby");
            assert_eq!(envelope.data, json!({"text": "hello"}));
            let metadata = envelope.metadata.clone().unwrap_or_default();
            assert_eq!(metadata.get("senderId"), Some(&json!(2)));
        }
        other => panic!("Expected a delivery, got {:?}", other),
    }
    // Publishing never produces a reply for the publisher
    bob.expect_silence(Duration::from_millis(200)).await;

    app.shutdown().await;
}

#[tokio::test]
async fn test_commands_require_authentication() {
    let app = TestApp::spawn().await;
    let mut client = TcpClient::connect(app.tcp_addr).await;

    client.send(&subscribe("users")).await;
    expect_error(client.recv().await, "UNAUTHORIZED");
    client.send(&TcpMessage::Ping).await;
    expect_error(client.recv().await, "UNAUTHORIZED");

    // The connection survives, authenticates and retries
    client.authenticate(5).await;
    client.send(&subscribe("users")).await;
    assert!(matches!(client.recv().await, TcpMessage::Subscribed(_)));
    client.send(&TcpMessage::Ping).await;
    assert!(matches!(client.recv().await, TcpMessage::Pong(Some(_))));

    app.shutdown().await;
}

#[tokio::test]
async fn test_invalid_token_and_reauthentication() {
    let app = TestApp::spawn().await;
    let mut client = TcpClient::connect(app.tcp_addr).await;

    client
        .send(&TcpMessage::Auth(AuthPayload {
            token: "not-a-jwt".into(),
        }))
        .await;
    expect_error(client.recv().await, "AUTH_FAILED");

    client.authenticate(9).await;
    client
        .send(&TcpMessage::Auth(AuthPayload { token: token_for(9) }))
        .await;
    expect_error(client.recv().await, "CONFLICT");

    app.shutdown().await;
}

#[tokio::test]
async fn test_subscription_errors() {
    let app = TestApp::spawn().await;
    let mut client = TcpClient::connect(app.tcp_addr).await;
    client.authenticate(3).await;

    client.send(&subscribe("users")).await;
    assert!(matches!(client.recv().await, TcpMessage::Subscribed(_)));
    client.send(&subscribe("users")).await;
    expect_error(client.recv().await, "CONFLICT");

    client
        .send(&TcpMessage::Unsubscribe(TopicPayload {
            topic: "messages".into(),
        }))
        .await;
    expect_error(client.recv().await, "NOT_FOUND");

    client.send(&subscribe("bad..pattern")).await;
    expect_error(client.recv().await, "VALIDATION_ERROR");

    client
        .send(&TcpMessage::Unsubscribe(TopicPayload {
            topic: "users".into(),
        }))
        .await;
    match client.recv().await {
        TcpMessage::Unsubscribed(ack) => assert_eq!(ack.topic, "users"),
        other => panic!("Expected unsubscribed, got {:?}", other),
    }

    app.shutdown().await;
}

#[tokio::test]
async fn test_fragmented_and_coalesced_frames() {
    let app = TestApp::spawn().await;
    let mut client = TcpClient::connect(app.tcp_addr).await;

    let auth = TcpMessage::Auth(AuthPayload { token: token_for(4) }).encode();
    for byte in auth.iter() {
        client.send_raw(&[*byte]).await;
    }
    assert!(matches!(client.recv().await, TcpMessage::AuthSuccess(_)));

    let mut batch = Vec::new();
    batch.extend_from_slice(&subscribe("users").encode());
    batch.extend_from_slice(&TcpMessage::Ping.encode());
    client.send_raw(&batch).await;
    assert!(matches!(client.recv().await, TcpMessage::Subscribed(_)));
    assert!(matches!(client.recv().await, TcpMessage::Pong(_)));

    app.shutdown().await;
}

#[tokio::test]
async fn test_bad_payload_keeps_connection_open() {
    let app = TestApp::spawn().await;
    let mut client = TcpClient::connect(app.tcp_addr).await;

    client.send_raw(&Frame::new(99, "{}").encode()).await;
    expect_error(client.recv().await, "VALIDATION_ERROR");

    client.send_raw(&Frame::new(2, "{not json").encode()).await;
    expect_error(client.recv().await, "VALIDATION_ERROR");

    client.authenticate(6).await;

    app.shutdown().await;
}

#[tokio::test]
async fn test_publish_ahead_of_corrupt_header_is_delivered() {
    let app = TestApp::spawn().await;
    let mut alice = TcpClient::connect(app.tcp_addr).await;
    let mut bob = TcpClient::connect(app.tcp_addr).await;
    alice.authenticate(1).await;
    bob.authenticate(2).await;

    alice.send(&subscribe("chat.lobby")).await;
    assert!(matches!(alice.recv().await, TcpMessage::Subscribed(_)));

    let mut chunk = publish("chat.lobby", json!("last words")).encode().to_vec();
    chunk.extend_from_slice(&[9, 0, 1, 0, 0, 0, 0]);
    bob.send_raw(&chunk).await;

    match alice.recv().await {
        TcpMessage::ServerMessage(envelope) => assert_eq!(envelope.data, json!("last words")),
        other => panic!("Expected a delivery, got {:?}", other),
    }
    assert!(bob.closed_by_server().await);

    app.shutdown().await;
}

#[tokio::test]
async fn test_framing_errors_close_the_connection() {
    let mut settings = test_settings();
    settings.tcp.max_frame_size = 64;
    let app = TestApp::spawn_with(settings).await;

    let mut oversized = TcpClient::connect(app.tcp_addr).await;
    oversized
        .send_raw(&Frame::new(4, vec![b' '; 128]).encode())
        .await;
    assert!(oversized.closed_by_server().await);

    let mut wrong_version = TcpClient::connect(app.tcp_addr).await;
    wrong_version.send_raw(&[9, 0, 5, 0, 0, 0, 0]).await;
    assert!(wrong_version.closed_by_server().await);

    let manager = app.state.tcp.manager().clone();
    eventually(|| manager.connection_count() == 0).await;

    app.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_subscriptions() {
    let app = TestApp::spawn().await;
    let mut client = TcpClient::connect(app.tcp_addr).await;
    client.authenticate(8).await;
    client.send(&subscribe("messages.user.8")).await;
    assert!(matches!(client.recv().await, TcpMessage::Subscribed(_)));

    let broker = app.state.broker.clone();
    assert_eq!(broker.subscription_count(None).await, 1);

    drop(client);

    let manager = app.state.tcp.manager().clone();
    eventually(|| manager.connection_count() == 0).await;
    assert_eq!(broker.subscription_count(None).await, 0);
    assert!(manager.connections_for_user(8).is_empty());

    app.shutdown().await;
}

#[tokio::test]
async fn test_per_ip_limit() {
    let mut settings = test_settings();
    settings.connections.max_per_ip = 1;
    let app = TestApp::spawn_with(settings).await;

    let mut first = TcpClient::connect(app.tcp_addr).await;
    first.authenticate(1).await;

    let mut second = TcpClient::connect(app.tcp_addr).await;
    expect_error(second.recv().await, "RESOURCE_LIMIT");
    assert!(second.closed_by_server().await);

    // The admitted connection is unaffected
    first.send(&TcpMessage::Ping).await;
    assert!(matches!(first.recv().await, TcpMessage::Pong(_)));

    app.shutdown().await;
}
