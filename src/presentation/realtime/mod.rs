//! Transport-Independent Real-Time Core
//!
//! Both the TCP and the WebSocket transports share the same connection
//! bookkeeping and the same per-connection state machine; they only differ
//! in how a [`Reply`] is put on the wire.
//!
//! ```text
//! socket -> transport decode -> Command -> SessionHandler -> {ConnectionManager, PubSubBroker}
//! PubSubBroker -> forwarder task -> Transport::render -> ConnectionManager::send_to_connection
//! ```

pub mod connection;
pub mod manager;
pub mod payloads;
pub mod session;

pub use connection::{Connection, ConnectionId, ConnectionUser, Outbound};
pub use manager::{ConnectionError, ConnectionLimits, ConnectionManager, Liveness};
pub use session::SessionHandler;

use std::sync::Arc;

use crate::infrastructure::pubsub::{Metadata, PubSubMessage};
use crate::shared::error::AppError;

/// A validated client action, independent of its wire encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Auth {
        token: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        data: serde_json::Value,
        metadata: Option<Metadata>,
    },
    Ping,
    Pong,
}

impl Command {
    /// Short name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Command::Auth { .. } => "auth",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Publish { .. } => "message",
            Command::Ping => "ping",
            Command::Pong => "pong",
        }
    }
}

/// Server-to-client message, independent of its wire encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    AuthSuccess {
        user_id: i64,
    },
    AuthError {
        code: &'static str,
        message: String,
    },
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Error {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },
    Pong,
    /// A broker delivery
    Delivery(Arc<PubSubMessage>),
}

impl Reply {
    /// Error reply for a failed command. Authentication failures get their
    /// own reply kind.
    pub fn from_error(err: &AppError) -> Self {
        match err {
            AppError::Authentication(_) => Reply::AuthError {
                code: err.code(),
                message: err.client_message(),
            },
            _ => Reply::Error {
                code: err.code(),
                message: err.client_message(),
                details: None,
            },
        }
    }
}

/// Wire flavor of a transport
pub trait Transport: Send + Sync + 'static {
    /// Label used in logs and metrics
    const NAME: &'static str;

    /// Encoded message handed to the connection's writer task
    type Outgoing: Clone + Send + Sync + std::fmt::Debug + 'static;

    fn render(reply: Reply) -> Self::Outgoing;
}
