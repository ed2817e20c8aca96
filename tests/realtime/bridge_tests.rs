//! Domain events reaching connected clients through the event bridge

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use realtime_server::domain::{EventKind, MessageEvent, PublicUser};
use realtime_server::presentation::realtime::payloads::TopicPayload;
use realtime_server::presentation::tcp::TcpMessage;

use crate::common::{eventually, TcpClient, TestApp};

async fn subscribed(client: &mut TcpClient, topic: &str) {
    client
        .send(&TcpMessage::Subscribe(TopicPayload {
            topic: topic.to_string(),
        }))
        .await;
    assert!(matches!(client.recv().await, TcpMessage::Subscribed(_)));
}

#[tokio::test]
async fn test_user_event_reaches_subscribers_and_directory() {
    let app = TestApp::spawn().await;
    let mut watcher = TcpClient::connect(app.tcp_addr).await;
    watcher.authenticate(1).await;
    subscribed(&mut watcher, "users.*").await;

    let mut user = PublicUser::new(42, "alice");
    user.display_name = Some("Alice".into());
    let event = app.state.events.emit(EventKind::UserCreated(user));

    match watcher.recv().await {
        TcpMessage::ServerMessage(envelope) => {
            assert_eq!(envelope.topic, "users.42");
            assert_eq!(envelope.data["username"], "alice");
            assert_eq!(envelope.data["displayName"], "Alice");
            let metadata = envelope.metadata.clone().unwrap_or_default();
            assert_eq!(metadata["eventType"], json!("user.created"));
            assert_eq!(metadata["eventId"], json!(event.id));
        }
        other => panic!("Expected a delivery, got {:?}", other),
    }
    // `users` itself is not matched by `users.*`
    watcher.expect_silence(Duration::from_millis(200)).await;

    let users = app.state.users.clone();
    eventually(|| users.len() == 1).await;

    // A later login picks up the cached profile
    let mut alice = TcpClient::connect(app.tcp_addr).await;
    alice.authenticate(42).await;
    let manager = app.state.tcp.manager().clone();
    let ids = manager.connections_for_user(42);
    assert_eq!(ids.len(), 1);
    let profile = manager
        .get(&ids[0])
        .and_then(|connection| connection.user())
        .and_then(|user| user.profile)
        .expect("Profile not attached");
    assert_eq!(profile.username, "alice");

    app.shutdown().await;
}

#[tokio::test]
async fn test_direct_message_is_delivered_once_per_topic() {
    let app = TestApp::spawn().await;
    let mut recipient = TcpClient::connect(app.tcp_addr).await;
    recipient.authenticate(7).await;
    subscribed(&mut recipient, "messages.user.7").await;
    let mut channel = TcpClient::connect(app.tcp_addr).await;
    channel.authenticate(8).await;
    subscribed(&mut channel, "messages.channel.*").await;

    // Note to self: sender and recipient share one topic
    app.state.events.emit(EventKind::MessageCreated(MessageEvent {
        id: 100,
        sender_id: 7,
        recipient_id: Some(7),
        channel_id: Some(3),
        content: "remember the milk".into(),
    }));

    match recipient.recv().await {
        TcpMessage::ServerMessage(envelope) => {
            assert_eq!(envelope.topic, "messages.user.7");
            assert_eq!(envelope.data["content"], "remember the milk");
        }
        other => panic!("Expected a delivery, got {:?}", other),
    }
    recipient.expect_silence(Duration::from_millis(200)).await;

    match channel.recv().await {
        TcpMessage::ServerMessage(envelope) => {
            assert_eq!(envelope.topic, "messages.channel.3");
            assert_eq!(envelope.data["senderId"], 7);
        }
        other => panic!("Expected a delivery, got {:?}", other),
    }

    app.shutdown().await;
}
