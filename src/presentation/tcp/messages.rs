//! TCP Message Codec
//!
//! Frame payloads are JSON objects whose shape is fixed by the frame's
//! message type. Decoding is strict: unknown types, malformed JSON and
//! payloads failing validation are rejected at the boundary.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::frame::Frame;
use crate::infrastructure::pubsub::PubSubMessage;
use crate::presentation::realtime::payloads::{AuthPayload, PublishPayload, TopicPayload};
use crate::presentation::realtime::{Command, Reply};
use crate::shared::error::AppError;
use crate::shared::validation::validation_error;

/// Message type discriminator. Values are part of the wire contract:
/// never renumber, only append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Auth = 1,
    Subscribe = 2,
    Unsubscribe = 3,
    Message = 4,
    Ping = 5,
    Pong = 6,
    AuthSuccess = 7,
    Subscribed = 8,
    Unsubscribed = 9,
    Error = 10,
    ServerMessage = 11,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Result<Self, DecodeError> {
        Ok(match value {
            1 => MessageType::Auth,
            2 => MessageType::Subscribe,
            3 => MessageType::Unsubscribe,
            4 => MessageType::Message,
            5 => MessageType::Ping,
            6 => MessageType::Pong,
            7 => MessageType::AuthSuccess,
            8 => MessageType::Subscribed,
            9 => MessageType::Unsubscribed,
            10 => MessageType::Error,
            11 => MessageType::ServerMessage,
            other => return Err(DecodeError::UnknownType(other)),
        })
    }
}

/// Payload decoding errors. The frame itself was sound, so the connection
/// survives them.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown message type {0}")]
    UnknownType(u16),

    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

impl DecodeError {
    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::Malformed(_) => "malformed",
            DecodeError::Invalid(_) => "invalid",
        }
    }
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        AppError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccessPayload {
    pub user_id: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicAckPayload {
    pub topic: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    pub timestamp: i64,
}

/// Typed TCP message
#[derive(Debug, Clone, PartialEq)]
pub enum TcpMessage {
    Auth(AuthPayload),
    Subscribe(TopicPayload),
    Unsubscribe(TopicPayload),
    Message(PublishPayload),
    Ping,
    Pong(Option<PongPayload>),
    AuthSuccess(AuthSuccessPayload),
    Subscribed(TopicAckPayload),
    Unsubscribed(TopicAckPayload),
    Error(ErrorPayload),
    ServerMessage(Arc<PubSubMessage>),
}

fn parse<T>(payload: &[u8]) -> Result<T, DecodeError>
where
    T: for<'de> Deserialize<'de> + Validate,
{
    let value: T = serde_json::from_slice(payload)?;
    value
        .validate()
        .map_err(|e| DecodeError::Invalid(validation_error(e).client_message()))?;
    Ok(value)
}

fn parse_plain<T>(payload: &[u8]) -> Result<T, DecodeError>
where
    T: for<'de> Deserialize<'de>,
{
    Ok(serde_json::from_slice(payload)?)
}

impl TcpMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            TcpMessage::Auth(_) => MessageType::Auth,
            TcpMessage::Subscribe(_) => MessageType::Subscribe,
            TcpMessage::Unsubscribe(_) => MessageType::Unsubscribe,
            TcpMessage::Message(_) => MessageType::Message,
            TcpMessage::Ping => MessageType::Ping,
            TcpMessage::Pong(_) => MessageType::Pong,
            TcpMessage::AuthSuccess(_) => MessageType::AuthSuccess,
            TcpMessage::Subscribed(_) => MessageType::Subscribed,
            TcpMessage::Unsubscribed(_) => MessageType::Unsubscribed,
            TcpMessage::Error(_) => MessageType::Error,
            TcpMessage::ServerMessage(_) => MessageType::ServerMessage,
        }
    }

    /// Decode a complete frame
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let payload = &frame.payload[..];
        Ok(match MessageType::from_u16(frame.message_type)? {
            MessageType::Auth => TcpMessage::Auth(parse(payload)?),
            MessageType::Subscribe => TcpMessage::Subscribe(parse(payload)?),
            MessageType::Unsubscribe => TcpMessage::Unsubscribe(parse(payload)?),
            MessageType::Message => TcpMessage::Message(parse(payload)?),
            // Keep-alives may carry an empty payload
            MessageType::Ping => TcpMessage::Ping,
            MessageType::Pong if payload.is_empty() => TcpMessage::Pong(None),
            MessageType::Pong => TcpMessage::Pong(Some(parse_plain(payload)?)),
            MessageType::AuthSuccess => TcpMessage::AuthSuccess(parse_plain(payload)?),
            MessageType::Subscribed => TcpMessage::Subscribed(parse_plain(payload)?),
            MessageType::Unsubscribed => TcpMessage::Unsubscribed(parse_plain(payload)?),
            MessageType::Error => TcpMessage::Error(parse_plain(payload)?),
            MessageType::ServerMessage => {
                TcpMessage::ServerMessage(Arc::new(parse_plain(payload)?))
            }
        })
    }

    fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            TcpMessage::Auth(p) => serde_json::to_vec(p),
            TcpMessage::Subscribe(p) | TcpMessage::Unsubscribe(p) => serde_json::to_vec(p),
            TcpMessage::Message(p) => serde_json::to_vec(p),
            TcpMessage::Ping | TcpMessage::Pong(None) => Ok(Vec::new()),
            TcpMessage::Pong(Some(p)) => serde_json::to_vec(p),
            TcpMessage::AuthSuccess(p) => serde_json::to_vec(p),
            TcpMessage::Subscribed(p) | TcpMessage::Unsubscribed(p) => serde_json::to_vec(p),
            TcpMessage::Error(p) => serde_json::to_vec(p),
            TcpMessage::ServerMessage(envelope) => serde_json::to_vec(envelope.as_ref()),
        }
    }

    /// Encode into a complete wire frame
    pub fn encode(&self) -> Bytes {
        let payload = match self.payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize TCP payload");
                Vec::new()
            }
        };
        Frame::new(self.message_type() as u16, payload).encode()
    }

    /// Client command carried by this message. `None` for server-only types.
    pub fn into_command(self) -> Option<Command> {
        match self {
            TcpMessage::Auth(p) => Some(Command::Auth { token: p.token }),
            TcpMessage::Subscribe(p) => Some(Command::Subscribe { topic: p.topic }),
            TcpMessage::Unsubscribe(p) => Some(Command::Unsubscribe { topic: p.topic }),
            TcpMessage::Message(p) => Some(Command::Publish {
                topic: p.topic,
                data: p.data,
                metadata: p.metadata,
            }),
            TcpMessage::Ping => Some(Command::Ping),
            TcpMessage::Pong(_) => Some(Command::Pong),
            _ => None,
        }
    }
}

impl From<Reply> for TcpMessage {
    fn from(reply: Reply) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        match reply {
            Reply::AuthSuccess { user_id } => {
                TcpMessage::AuthSuccess(AuthSuccessPayload { user_id, timestamp })
            }
            // The binary protocol has no dedicated auth error type
            Reply::AuthError { code, message } => TcpMessage::Error(ErrorPayload {
                code: code.to_string(),
                message,
                details: None,
                timestamp,
            }),
            Reply::Subscribed { topic } => {
                TcpMessage::Subscribed(TopicAckPayload { topic, timestamp })
            }
            Reply::Unsubscribed { topic } => {
                TcpMessage::Unsubscribed(TopicAckPayload { topic, timestamp })
            }
            Reply::Error {
                code,
                message,
                details,
            } => TcpMessage::Error(ErrorPayload {
                code: code.to_string(),
                message,
                details,
                timestamp,
            }),
            Reply::Pong => TcpMessage::Pong(Some(PongPayload { timestamp })),
            Reply::Delivery(envelope) => TcpMessage::ServerMessage(envelope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn frame(message_type: MessageType, payload: serde_json::Value) -> Frame {
        Frame::new(message_type as u16, serde_json::to_vec(&payload).unwrap())
    }

    #[test]
    fn test_decode_client_messages() {
        let msg = TcpMessage::decode(&frame(MessageType::Auth, json!({"token": "abc"}))).unwrap();
        assert_eq!(
            msg.into_command(),
            Some(Command::Auth {
                token: "abc".into()
            })
        );

        let msg = TcpMessage::decode(&frame(
            MessageType::Message,
            json!({"topic": "messages.user.1", "data": {"text": "hi"}}),
        ))
        .unwrap();
        assert_eq!(
            msg.into_command(),
            Some(Command::Publish {
                topic: "messages.user.1".into(),
                data: json!({"text": "hi"}),
                metadata: None,
            })
        );

        let ping = Frame::new(MessageType::Ping as u16, Bytes::new());
        assert_eq!(TcpMessage::decode(&ping).unwrap(), TcpMessage::Ping);
    }

    #[test_case(99, b"{}" ; "unknown type")]
    #[test_case(2, b"{not json" ; "malformed json")]
    #[test_case(2, b"{\"topic\": \"\"}" ; "empty topic")]
    #[test_case(1, b"{\"token\": 5}" ; "wrong field type")]
    fn test_decode_errors(message_type: u16, payload: &'static [u8]) {
        let err = TcpMessage::decode(&Frame::new(message_type, payload)).unwrap_err();
        let app: AppError = err.into();
        assert_eq!(app.code(), "VALIDATION_ERROR");
        assert!(!app.is_fatal());
    }

    #[test]
    fn test_server_replies_encode_to_expected_types() {
        let encoded = TcpMessage::from(Reply::AuthError {
            code: "AUTH_FAILED",
            message: "Invalid token".into(),
        })
        .encode();
        let decoded_frame = {
            let mut parser = super::super::frame::FrameParser::new(1024);
            parser.feed(&encoded).into_result().unwrap().remove(0)
        };
        assert_eq!(decoded_frame.message_type, MessageType::Error as u16);

        match TcpMessage::decode(&decoded_frame).unwrap() {
            TcpMessage::Error(payload) => {
                assert_eq!(payload.code, "AUTH_FAILED");
                assert_eq!(payload.message, "Invalid token");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delivery_becomes_server_message() {
        let envelope = Arc::new(PubSubMessage::new("users", json!({"id": 1}), None));
        let msg = TcpMessage::from(Reply::Delivery(Arc::clone(&envelope)));
        assert_eq!(msg.message_type(), MessageType::ServerMessage);
        assert!(msg.clone().into_command().is_none());

        let decoded = TcpMessage::decode(&Frame::new(
            MessageType::ServerMessage as u16,
            msg.payload().unwrap(),
        ))
        .unwrap();
        assert_eq!(decoded, TcpMessage::ServerMessage(envelope));
    }
}
