//! JSON over WebSocket, including cross-transport delivery

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use realtime_server::presentation::realtime::payloads::TopicPayload;
use realtime_server::presentation::tcp::TcpMessage;

use crate::common::{eventually, token_for, TcpClient, TestApp, RECV_TIMEOUT};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(app: &TestApp) -> Socket {
    let (socket, _) = connect_async(app.ws_url())
        .await
        .expect("WebSocket handshake failed");
    socket
}

async fn send(socket: &mut Socket, value: Value) {
    socket
        .send(Message::text(value.to_string()))
        .await
        .expect("Send failed");
}

/// Next JSON message, skipping control frames
async fn recv(socket: &mut Socket) -> Value {
    loop {
        let message = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("Timed out waiting for a message");
        match message {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("Server sent invalid JSON")
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("Expected a text message, got {:?}", other),
        }
    }
}

async fn authenticate(socket: &mut Socket, user_id: i64) {
    send(socket, json!({"type": "auth", "token": token_for(user_id)})).await;
    let reply = recv(socket).await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["userId"], user_id);
}

async fn subscribe(socket: &mut Socket, topic: &str) {
    send(socket, json!({"type": "subscribe", "topic": topic})).await;
    let reply = recv(socket).await;
    assert_eq!(reply["type"], "subscribed");
    assert_eq!(reply["topic"], topic);
}

#[tokio::test]
async fn test_websocket_publish_and_deliver() {
    let app = TestApp::spawn().await;
    let mut alice = connect(&app).await;
    let mut bob = connect(&app).await;
    authenticate(&mut alice, 1).await;
    authenticate(&mut bob, 2).await;
    subscribe(&mut alice, "rooms.**").await;

    send(
        &mut bob,
        json!({
            "type": "message",
            "topic": "rooms.general.typing",
            "data": {"typing": true},
            "metadata": {"client": "test"}
        }),
    )
    .await;

    let delivery = recv(&mut alice).await;
    assert_eq!(delivery["type"], "message");
    assert_eq!(delivery["topic"], "rooms.general.typing");
    assert_eq!(delivery["data"], json!({"typing": true}));
    assert_eq!(delivery["metadata"]["client"], "test");
    assert_eq!(delivery["metadata"]["senderId"], 2);
    assert!(delivery["messageId"].is_string());

    app.shutdown().await;
}

#[tokio::test]
async fn test_websocket_errors_keep_connection_open() {
    let app = TestApp::spawn().await;
    let mut socket = connect(&app).await;

    send(&mut socket, json!({"type": "subscribe", "topic": "users"})).await;
    let reply = recv(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "UNAUTHORIZED");

    socket
        .send(Message::text("{definitely not json"))
        .await
        .expect("Send failed");
    let reply = recv(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "VALIDATION_ERROR");

    send(&mut socket, json!({"type": "auth", "token": "garbage"})).await;
    let reply = recv(&mut socket).await;
    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["code"], "AUTH_FAILED");

    authenticate(&mut socket, 3).await;
    send(&mut socket, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut socket).await["type"], "pong");

    app.shutdown().await;
}

#[tokio::test]
async fn test_cross_transport_delivery() {
    let app = TestApp::spawn().await;

    let mut web = connect(&app).await;
    authenticate(&mut web, 10).await;
    subscribe(&mut web, "alerts").await;

    let mut tcp = TcpClient::connect(app.tcp_addr).await;
    tcp.authenticate(11).await;
    tcp.send(&TcpMessage::Subscribe(TopicPayload {
        topic: "alerts".into(),
    }))
    .await;
    assert!(matches!(tcp.recv().await, TcpMessage::Subscribed(_)));

    // WebSocket -> TCP (and back to the publisher itself)
    send(
        &mut web,
        json!({"type": "message", "topic": "alerts", "data": {"level": "high"}}),
    )
    .await;
    match tcp.recv().await {
        TcpMessage::ServerMessage(envelope) => {
            assert_eq!(envelope.topic, "alerts");
            assert_eq!(envelope.data, json!({"level": "high"}));
        }
        other => panic!("Expected a delivery, got {:?}", other),
    }
    assert_eq!(recv(&mut web).await["data"], json!({"level": "high"}));

    app.shutdown().await;
}

#[tokio::test]
async fn test_client_close_cleans_up() {
    let app = TestApp::spawn().await;
    let mut socket = connect(&app).await;
    authenticate(&mut socket, 12).await;
    subscribe(&mut socket, "users.12").await;

    let manager = app.state.websocket.manager().clone();
    assert_eq!(manager.connection_count(), 1);
    assert_eq!(manager.authenticated_count(), 1);

    socket.close(None).await.expect("Close failed");

    eventually(|| manager.connection_count() == 0).await;
    assert_eq!(manager.authenticated_count(), 0);
    assert_eq!(manager.topic_subscribers("users.12"), 0);
    assert_eq!(app.state.broker.subscription_count(None).await, 0);

    app.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_websocket_clients() {
    let app = TestApp::spawn().await;
    let mut socket = connect(&app).await;
    authenticate(&mut socket, 13).await;

    app.shutdown().await;

    let next = timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("Socket stayed open after shutdown");
    assert!(
        !matches!(next, Some(Ok(Message::Text(_)))),
        "Unexpected message after shutdown: {:?}",
        next
    );
}
