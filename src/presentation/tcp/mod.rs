//! Binary TCP Transport
//!
//! Length-prefixed frames carrying JSON payloads, one reader and one writer
//! task per connection.

pub mod frame;
pub mod handler;
pub mod messages;
pub mod server;

pub use frame::{Frame, FrameError, FrameParser, Parsed, HEADER_LEN, PROTOCOL_VERSION};
pub use handler::handle_connection;
pub use messages::{DecodeError, MessageType, TcpMessage};
pub use server::TcpServer;

use bytes::Bytes;

use crate::presentation::realtime::{ConnectionManager, Reply, SessionHandler, Transport};

/// TCP flavor of the real-time core
#[derive(Debug)]
pub struct Tcp;

impl Transport for Tcp {
    const NAME: &'static str = "tcp";
    type Outgoing = Bytes;

    fn render(reply: Reply) -> Bytes {
        TcpMessage::from(reply).encode()
    }
}

pub type TcpConnectionManager = ConnectionManager<Bytes>;
pub type TcpSessionHandler = SessionHandler<Tcp>;
