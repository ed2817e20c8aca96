//! Event Bridge
//!
//! Republishes domain events onto pub/sub topics so that business logic
//! never talks to transports:
//!
//! | Event           | Topics                                                      |
//! |-----------------|-------------------------------------------------------------|
//! | user.*          | `users`, `users.<id>`                                       |
//! | message.*       | `messages`, `messages.user.<sender>`,                       |
//! |                 | `messages.user.<recipient>`, `messages.channel.<channel>`   |
//!
//! Every envelope carries the originating `eventId`, `eventType` and
//! `occurredAt` as metadata.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{DomainEvent, EventBus, EventKind};
use crate::infrastructure::pubsub::{Metadata, PubSubBroker, PubSubError};
use crate::infrastructure::users::InMemoryUserDirectory;

/// Domain event stream -> pub/sub topics
#[derive(Debug)]
pub struct EventBridge {
    broker: Arc<PubSubBroker>,
    directory: Option<InMemoryUserDirectory>,
}

impl EventBridge {
    pub fn new(broker: Arc<PubSubBroker>) -> Self {
        Self {
            broker,
            directory: None,
        }
    }

    /// Keep `directory` in sync with user lifecycle events
    pub fn with_directory(mut self, directory: InMemoryUserDirectory) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Every topic an event fans out to, without duplicates
    pub fn topics_for(event: &DomainEvent) -> Vec<String> {
        let mut topics = Vec::new();
        match &event.kind {
            EventKind::UserCreated(user) | EventKind::UserUpdated(user) => {
                topics.push("users".to_string());
                topics.push(format!("users.{}", user.id));
            }
            EventKind::MessageCreated(message)
            | EventKind::MessageUpdated(message)
            | EventKind::MessageDeleted(message) => {
                topics.push("messages".to_string());
                topics.push(format!("messages.user.{}", message.sender_id));
                if let Some(recipient) = message.recipient_id {
                    topics.push(format!("messages.user.{}", recipient));
                }
                if let Some(channel) = message.channel_id {
                    topics.push(format!("messages.channel.{}", channel));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        topics.retain(|topic| seen.insert(topic.clone()));
        topics
    }

    fn metadata(event: &DomainEvent) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("eventId".into(), json!(event.id));
        metadata.insert("eventType".into(), json!(event.event_type()));
        metadata.insert("occurredAt".into(), json!(event.occurred_at.to_rfc3339()));
        metadata
    }

    fn payload(event: &DomainEvent) -> Result<serde_json::Value, PubSubError> {
        Ok(match &event.kind {
            EventKind::UserCreated(user) | EventKind::UserUpdated(user) => {
                serde_json::to_value(user)?
            }
            EventKind::MessageCreated(message)
            | EventKind::MessageUpdated(message)
            | EventKind::MessageDeleted(message) => serde_json::to_value(message)?,
        })
    }

    /// Publish one event to all of its topics.
    ///
    /// A failing topic is logged and skipped; returns how many topics were
    /// published.
    pub async fn handle(&self, event: &DomainEvent) -> Result<usize, PubSubError> {
        if let (Some(directory), EventKind::UserCreated(user) | EventKind::UserUpdated(user)) =
            (&self.directory, &event.kind)
        {
            directory.upsert(user.clone());
        }

        let data = Self::payload(event)?;
        let metadata = Self::metadata(event);
        let mut published = 0;
        for topic in Self::topics_for(event) {
            match self
                .broker
                .publish(&topic, data.clone(), Some(metadata.clone()))
                .await
            {
                Ok(message_id) => {
                    published += 1;
                    debug!(
                        event_id = %event.id,
                        topic = %topic,
                        message_id = %message_id,
                        "Event republished"
                    );
                }
                Err(e) => {
                    warn!(event_id = %event.id, topic = %topic, error = %e, "Failed to republish event");
                }
            }
        }
        Ok(published)
    }

    /// Consume `bus` until it closes
    pub fn spawn(self: Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            info!("Event bridge started");
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.handle(&event).await {
                            warn!(
                                event_id = %event.id,
                                event_type = event.event_type(),
                                error = %e,
                                "Event bridge failed to handle event"
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event bridge lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("Event bridge stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::domain::{MessageEvent, PublicUser, UserLookup};

    fn message(sender: i64, recipient: Option<i64>, channel: Option<i64>) -> DomainEvent {
        DomainEvent::new(EventKind::MessageCreated(MessageEvent {
            id: 100,
            sender_id: sender,
            recipient_id: recipient,
            channel_id: channel,
            content: "hello".into(),
        }))
    }

    #[test]
    fn test_message_topics() {
        assert_eq!(
            EventBridge::topics_for(&message(1, Some(2), Some(9))),
            vec![
                "messages",
                "messages.user.1",
                "messages.user.2",
                "messages.channel.9"
            ]
        );
        assert_eq!(
            EventBridge::topics_for(&message(1, None, None)),
            vec!["messages", "messages.user.1"]
        );
    }

    #[test]
    fn test_message_to_self_is_published_once_per_topic() {
        assert_eq!(
            EventBridge::topics_for(&message(5, Some(5), None)),
            vec!["messages", "messages.user.5"]
        );
    }

    #[test]
    fn test_user_topics() {
        let event = DomainEvent::new(EventKind::UserUpdated(PublicUser::new(3, "carol")));
        assert_eq!(EventBridge::topics_for(&event), vec!["users", "users.3"]);
    }

    #[tokio::test]
    async fn test_metadata_and_payload_reach_subscribers() {
        let broker = Arc::new(PubSubBroker::in_memory().await);
        let (_, mut rx) = broker.subscribe_channel("messages.user.2").await.unwrap();
        let bridge = EventBridge::new(Arc::clone(&broker));

        let event = message(1, Some(2), None);
        assert_eq!(bridge.handle(&event).await.unwrap(), 2);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, "messages.user.2");
        assert_eq!(envelope.data["content"], "hello");
        let metadata = envelope.metadata.clone().unwrap();
        assert_eq!(metadata["eventId"], json!(event.id));
        assert_eq!(metadata["eventType"], "message.created");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawned_bridge_updates_directory() {
        let broker = Arc::new(PubSubBroker::in_memory().await);
        let directory = InMemoryUserDirectory::new();
        let bus = EventBus::default();
        let (_, mut rx) = broker.subscribe_channel("users.*").await.unwrap();

        let bridge = Arc::new(EventBridge::new(broker).with_directory(directory.clone()));
        let task = bridge.spawn(&bus);

        bus.emit(EventKind::UserCreated(PublicUser::new(8, "dave")));
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, "users.8");
        assert_eq!(
            directory.find_by_id(8).await.unwrap().map(|u| u.username),
            Some("dave".to_string())
        );

        drop(bus);
        task.await.unwrap();
    }
}
