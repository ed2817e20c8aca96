//! TCP Connection Handler
//!
//! Drives one accepted socket: a writer task drains the connection's
//! outbound queue, the reader loop parses frames and feeds commands to the
//! session handler.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::frame::FrameParser;
use super::messages::TcpMessage;
use super::{Tcp, TcpSessionHandler};
use crate::infrastructure::metrics;
use crate::presentation::realtime::{Outbound, Reply, Transport};
use crate::shared::error::AppError;

const READ_CHUNK: usize = 8 * 1024;

/// Serve one TCP client until it disconnects or is closed by the server
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    handler: Arc<TcpSessionHandler>,
    max_frame_size: usize,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let (mut reader, mut writer) = stream.into_split();

    let (connection, outbound) = match handler.open(remote_addr) {
        Ok(opened) => opened,
        Err(err) => {
            // Refused: tell the peer why, then hang up
            let frame = Tcp::render(Reply::from_error(&err));
            let _ = writer.write_all(&frame).await;
            let _ = writer.shutdown().await;
            return;
        }
    };
    let connection_id = connection.id.clone();

    let writer_task = tokio::spawn(write_loop(writer, outbound, connection_id.clone()));

    let mut parser = FrameParser::new(max_frame_size);
    let mut chunk = vec![0u8; READ_CHUNK];

    'read: loop {
        tokio::select! {
            _ = connection.closed() => {
                tracing::debug!(connection_id = %connection_id, "Closed by server");
                break;
            }
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => {
                        tracing::debug!(connection_id = %connection_id, "Peer closed connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "Read error");
                        break;
                    }
                };

                let parsed = parser.feed(&chunk[..n]);

                // Frames completed ahead of a corrupt header still run
                for frame in parsed.frames {
                    match TcpMessage::decode(&frame) {
                        Ok(message) => match message.into_command() {
                            Some(command) => handler.handle(&connection, command).await,
                            None => handler.reject(
                                &connection,
                                &AppError::Validation(format!(
                                    "Message type {} is not accepted from clients",
                                    frame.message_type
                                )),
                            ),
                        },
                        Err(e) => {
                            metrics::record_frame_error(e.kind());
                            connection.touch();
                            handler.reject(&connection, &e.into());
                        }
                    }
                    if connection.is_closing() {
                        break 'read;
                    }
                }

                if let Some(e) = parsed.error {
                    metrics::record_frame_error(e.kind());
                    let err = AppError::from(e);
                    if err.is_fatal() {
                        tracing::warn!(
                            connection_id = %connection_id,
                            error = %err,
                            "Framing error, closing connection"
                        );
                        break;
                    }
                }
            }
        }
    }

    connection.close();
    handler.disconnect(&connection_id).await;
    if let Err(e) = writer_task.await {
        if !e.is_cancelled() {
            tracing::warn!(connection_id = %connection_id, error = %e, "Writer task failed");
        }
    }
}

/// Own the write half: write queued frames until told to close
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Outbound<bytes::Bytes>>,
    connection_id: String,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::debug!(connection_id = %connection_id, error = %e, "Write failed");
                    break;
                }
            }
            Outbound::Ping => {
                let frame = TcpMessage::Ping.encode();
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            Outbound::Close(ack) => {
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}
