//! Domain Events
//!
//! Lifecycle events raised by business logic. Transports never see these
//! directly; the event bridge republishes them onto pub/sub topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::user::PublicUser;

/// Default capacity of the event bus ring buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Message payload carried by message lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub id: i64,
    pub sender_id: i64,

    /// Direct message recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,

    pub content: String,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    UserCreated(PublicUser),
    UserUpdated(PublicUser),
    MessageCreated(MessageEvent),
    MessageUpdated(MessageEvent),
    MessageDeleted(MessageEvent),
}

impl EventKind {
    /// Dotted event name used in envelope metadata
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::UserCreated(_) => "user.created",
            EventKind::UserUpdated(_) => "user.updated",
            EventKind::MessageCreated(_) => "message.created",
            EventKind::MessageUpdated(_) => "message.updated",
            EventKind::MessageDeleted(_) => "message.deleted",
        }
    }
}

/// One domain event, immutable once raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DomainEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// In-process domain event stream
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Raise an event. Having no listener is not an error.
    pub fn emit(&self, kind: EventKind) -> DomainEvent {
        let event = DomainEvent::new(kind);
        let listeners = self.sender.send(event.clone()).unwrap_or(0);
        tracing::trace!(
            event_id = %event.id,
            event_type = event.event_type(),
            listeners,
            "Domain event emitted"
        );
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
