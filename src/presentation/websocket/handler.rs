//! WebSocket Connection Handler
//!
//! Upgrades `GET /ws` and serves one socket: a sender task drains the
//! connection's outbound queue while the main loop feeds parsed client
//! messages to the session handler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::messages::ClientMessage;
use super::WsSessionHandler;
use crate::presentation::realtime::{Command, Outbound, Reply, Transport};
use crate::shared::error::AppError;
use crate::startup::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let limits = &state.settings.websocket;
    let handler = Arc::clone(&state.websocket);
    ws.max_message_size(limits.max_message_size)
        .max_frame_size(limits.max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, remote_addr, handler))
}

/// Handle individual WebSocket connection
pub async fn handle_socket(socket: WebSocket, remote_addr: SocketAddr, handler: Arc<WsSessionHandler>) {
    // Split socket for concurrent read/write
    let (mut sender, mut receiver) = socket.split();

    let (connection, outbound) = match handler.open(remote_addr) {
        Ok(opened) => opened,
        Err(err) => {
            let text = super::WebSocket::render(Reply::from_error(&err));
            let _ = sender.send(Message::Text(text.into())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let connection_id = connection.id.clone();

    // Spawn task to forward queued messages to the socket
    let sender_task = tokio::spawn(send_loop(sender, outbound, connection_id.clone()));

    // Main message loop
    loop {
        tokio::select! {
            _ = connection.closed() => {
                tracing::debug!(connection_id = %connection_id, "Closed by server");
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::parse(text.as_str()) {
                            Ok(message) => {
                                handler.handle(&connection, Command::from(message)).await;
                            }
                            Err(err) => {
                                connection.touch();
                                handler.reject(&connection, &err);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        connection.touch();
                        handler.reject(
                            &connection,
                            &AppError::Validation("Binary frames are not supported".into()),
                        );
                    }
                    Some(Ok(Message::Pong(_))) => {
                        connection.record_pong();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled automatically by axum
                        connection.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(connection_id = %connection_id, "Connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        // Oversized messages surface here
                        tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                        handler.reject(
                            &connection,
                            &AppError::Validation(format!("WebSocket protocol error: {}", e)),
                        );
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    connection.close();
    handler.disconnect(&connection_id).await;
    if let Err(e) = sender_task.await {
        tracing::warn!(connection_id = %connection_id, error = %e, "Sender task failed");
    }
}

async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound<String>>,
    connection_id: String,
) {
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Message(text) => sender.send(Message::Text(text.into())).await,
            Outbound::Ping => sender.send(Message::Ping(Bytes::new())).await,
            Outbound::Close(ack) => {
                let _ = sender.send(Message::Close(None)).await;
                let _ = sender.close().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        };
        if let Err(e) = result {
            tracing::debug!(connection_id = %connection_id, error = %e, "Send failed");
            break;
        }
    }
}
