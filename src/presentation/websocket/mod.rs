//! WebSocket Transport
//!
//! JSON text frames over `GET /ws`.

pub mod handler;
pub mod messages;

pub use handler::{handle_socket, ws_handler};
pub use messages::{ClientMessage, ServerMessage};

use crate::presentation::realtime::{ConnectionManager, Reply, SessionHandler, Transport};

/// WebSocket flavor of the real-time core
#[derive(Debug)]
pub struct WebSocket;

impl Transport for WebSocket {
    const NAME: &'static str = "websocket";
    type Outgoing = String;

    fn render(reply: Reply) -> String {
        ServerMessage::from(reply).to_json()
    }
}

pub type WsConnectionManager = ConnectionManager<String>;
pub type WsSessionHandler = SessionHandler<WebSocket>;
