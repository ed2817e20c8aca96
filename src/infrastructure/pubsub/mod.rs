//! Publish/Subscribe Backbone
//!
//! Topic-based fan-out shared by every transport.
//!
//! # Architecture
//!
//! ```text
//! +-------------------+
//! |   PubSubBroker    |  <-- facade, owns the active backend
//! +-------------------+
//!          |
//!          v
//! +-------------------+
//! |  DeliveryBackend  |  <-- trait
//! +-------------------+
//!     |           |
//!     v           v
//! +--------+  +--------+
//! | Memory |  | Redis  |
//! +--------+  +--------+
//!     \           /
//!      v         v
//! +-------------------+
//! | SubscriptionTable |  <-- local registrations + topic matching
//! +-------------------+
//! ```
//!
//! A subscriber is an unbounded channel sender. Delivery is a channel send,
//! so a slow or dead subscriber never blocks the publisher or its peers.

mod broker;
mod memory;
mod redis_backend;
mod table;
pub mod topic;

pub use self::broker::PubSubBroker;
pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;
pub use self::table::SubscriptionTable;
pub use self::topic::{matches, TopicPattern};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::shared::error::AppError;

/// Envelope metadata (event type, correlation ids, sender info)
pub type Metadata = HashMap<String, serde_json::Value>;

/// Handle used to deliver envelopes to one subscription
pub type MessageSender = mpsc::UnboundedSender<Arc<PubSubMessage>>;

/// Receiving side of a subscription
pub type MessageReceiver = mpsc::UnboundedReceiver<Arc<PubSubMessage>>;

/// Unique id of one subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message envelope passed through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubMessage {
    pub message_id: Uuid,
    pub topic: String,
    pub data: serde_json::Value,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl PubSubMessage {
    pub fn new(topic: impl Into<String>, data: serde_json::Value, metadata: Option<Metadata>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            topic: topic.into(),
            data,
            published_at: Utc::now(),
            metadata,
        }
    }
}

/// Subscription record owned by a delivery backend
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: TopicPattern,
    pub created_at: DateTime<Utc>,
    pub sender: MessageSender,
}

impl Subscription {
    pub fn new(pattern: &str, sender: MessageSender) -> Self {
        Self {
            id: SubscriptionId::new(),
            pattern: TopicPattern::new(pattern),
            created_at: Utc::now(),
            sender,
        }
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            pattern: self.pattern.as_str().to_string(),
            created_at: self.created_at,
        }
    }
}

/// Read-only view of a subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

/// Delivery statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubStats {
    pub backend: &'static str,
    pub connected: bool,
    pub fallback_active: bool,
    pub subscriptions: usize,
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Which delivery backend to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

/// Pub/sub error type
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Backend not connected")]
    NotConnected,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl From<PubSubError> for AppError {
    fn from(err: PubSubError) -> Self {
        match err {
            PubSubError::InvalidTopic(msg) | PubSubError::InvalidPattern(msg) => {
                AppError::Validation(msg)
            }
            PubSubError::Redis(e) => AppError::Redis(e),
            other => AppError::Backend(other.to_string()),
        }
    }
}

/// Pluggable topic fan-out
#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    /// Short backend name used in logs and stats
    fn name(&self) -> &'static str;

    /// Whether this backend can be replaced by the in-process one
    fn is_distributed(&self) -> bool;

    async fn connect(&self) -> Result<(), PubSubError>;

    async fn disconnect(&self) -> Result<(), PubSubError>;

    fn is_connected(&self) -> bool;

    /// Fan a message out to every matching subscription
    async fn publish(&self, message: &PubSubMessage) -> Result<(), PubSubError>;

    /// Register a subscription record
    async fn subscribe(&self, subscription: Subscription) -> Result<(), PubSubError>;

    /// Remove one subscription. Returns false if it was unknown.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, PubSubError>;

    /// Remove every subscription registered with exactly this pattern
    async fn unsubscribe_all(&self, pattern: &str) -> Result<usize, PubSubError>;

    /// Full subscription records, used to migrate to another backend
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Subscription count, optionally restricted to one pattern
    fn subscription_count(&self, pattern: Option<&str>) -> usize;

    async fn clear(&self) -> Result<(), PubSubError>;

    fn stats(&self) -> PubSubStats;
}
