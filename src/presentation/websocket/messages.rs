//! WebSocket Message Types
//!
//! One JSON object per text frame, discriminated by `type`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::infrastructure::pubsub::Metadata;
use crate::presentation::realtime::payloads::{AuthPayload, PublishPayload, TopicPayload};
use crate::presentation::realtime::{Command, Reply};
use crate::shared::error::AppError;
use crate::shared::validation::validate;

/// Incoming client message
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth(AuthPayload),
    Subscribe(TopicPayload),
    Unsubscribe(TopicPayload),
    Message(PublishPayload),
    Ping,
    Pong,
}

impl ClientMessage {
    /// Parse and validate one text frame
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let message: ClientMessage = serde_json::from_str(text)
            .map_err(|e| AppError::Validation(format!("Invalid message: {}", e)))?;
        match &message {
            ClientMessage::Auth(p) => validate(p)?,
            ClientMessage::Subscribe(p) | ClientMessage::Unsubscribe(p) => validate(p)?,
            ClientMessage::Message(p) => validate(p)?,
            ClientMessage::Ping | ClientMessage::Pong => {}
        }
        Ok(message)
    }
}

impl From<ClientMessage> for Command {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Auth(p) => Command::Auth { token: p.token },
            ClientMessage::Subscribe(p) => Command::Subscribe { topic: p.topic },
            ClientMessage::Unsubscribe(p) => Command::Unsubscribe { topic: p.topic },
            ClientMessage::Message(p) => Command::Publish {
                topic: p.topic,
                data: p.data,
                metadata: p.metadata,
            },
            ClientMessage::Ping => Command::Ping,
            ClientMessage::Pong => Command::Pong,
        }
    }
}

/// Outgoing server message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(rename = "userId")]
        user_id: i64,
        timestamp: i64,
    },
    AuthError {
        message: String,
        code: String,
        timestamp: i64,
    },
    Subscribed {
        topic: String,
        timestamp: i64,
    },
    Unsubscribed {
        topic: String,
        timestamp: i64,
    },
    /// A broker delivery
    Message {
        #[serde(rename = "messageId")]
        message_id: String,
        topic: String,
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

impl From<Reply> for ServerMessage {
    fn from(reply: Reply) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        match reply {
            Reply::AuthSuccess { user_id } => ServerMessage::AuthSuccess { user_id, timestamp },
            Reply::AuthError { code, message } => ServerMessage::AuthError {
                message,
                code: code.to_string(),
                timestamp,
            },
            Reply::Subscribed { topic } => ServerMessage::Subscribed { topic, timestamp },
            Reply::Unsubscribed { topic } => ServerMessage::Unsubscribed { topic, timestamp },
            Reply::Error {
                code,
                message,
                details,
            } => ServerMessage::Error {
                code: code.to_string(),
                message,
                details,
                timestamp,
            },
            Reply::Pong => ServerMessage::Pong { timestamp },
            Reply::Delivery(envelope) => ServerMessage::Message {
                message_id: envelope.message_id.to_string(),
                topic: envelope.topic.clone(),
                data: envelope.data.clone(),
                metadata: envelope.metadata.clone(),
                timestamp: envelope.published_at.timestamp_millis(),
            },
        }
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                r#"{"type":"error","code":"INTERNAL_ERROR","message":"Internal server error","timestamp":0}"#
                    .to_string()
            }
        }
    }
}
