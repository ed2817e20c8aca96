//! PubSub Broker
//!
//! Facade over the active delivery backend. The configured backend is tried
//! on `connect`; if it is unreachable, or later fails to publish, the broker
//! swaps in the in-process backend, carrying every live subscription over
//! with its original id. Callers never observe the swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    BackendKind, DeliveryBackend, MemoryBackend, MessageReceiver, MessageSender, Metadata,
    PubSubError, PubSubMessage, PubSubStats, RedisBackend, Subscription, SubscriptionId,
    SubscriptionInfo,
};
use crate::config::PubSubSettings;
use crate::shared::validation::{validate_pattern, validate_topic};

/// Shared publish/subscribe router
pub struct PubSubBroker {
    backend: RwLock<Arc<dyn DeliveryBackend>>,
    fallback_active: AtomicBool,
}

impl PubSubBroker {
    /// Build a broker around the configured backend. Nothing connects yet.
    pub fn new(settings: &PubSubSettings) -> Self {
        let backend: Arc<dyn DeliveryBackend> = match settings.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Redis => Arc::new(RedisBackend::new(settings)),
        };
        Self::with_backend(backend)
    }

    /// Broker around an explicit backend
    pub fn with_backend(backend: Arc<dyn DeliveryBackend>) -> Self {
        Self {
            backend: RwLock::new(backend),
            fallback_active: AtomicBool::new(false),
        }
    }

    /// In-process broker, already usable
    pub async fn in_memory() -> Self {
        let broker = Self::with_backend(Arc::new(MemoryBackend::new()));
        if let Err(e) = broker.connect().await {
            warn!(error = %e, "In-memory backend failed to connect");
        }
        broker
    }

    async fn current(&self) -> Arc<dyn DeliveryBackend> {
        Arc::clone(&*self.backend.read().await)
    }

    /// Connect the configured backend, falling back to in-process delivery
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), PubSubError> {
        let backend = self.current().await;
        match backend.connect().await {
            Ok(()) => {
                info!(backend = backend.name(), "PubSub backend connected");
                Ok(())
            }
            Err(e) if backend.is_distributed() => {
                warn!(
                    backend = backend.name(),
                    error = %e,
                    "PubSub backend unavailable, falling back to in-memory delivery"
                );
                self.fall_back(&backend).await
            }
            Err(e) => Err(e),
        }
    }

    /// Replace `failed` with a connected in-process backend.
    ///
    /// Holds the write lock for the whole migration so no subscribe or
    /// unsubscribe can slip between the snapshot and the swap.
    async fn fall_back(&self, failed: &Arc<dyn DeliveryBackend>) -> Result<(), PubSubError> {
        let mut active = self.backend.write().await;
        if !Arc::ptr_eq(&*active, failed) {
            // Another task already swapped
            return Ok(());
        }

        let replacement: Arc<dyn DeliveryBackend> = Arc::new(MemoryBackend::new());
        replacement.connect().await?;
        let migrated = failed.subscriptions();
        let count = migrated.len();
        for subscription in migrated {
            replacement.subscribe(subscription).await?;
        }
        *active = replacement;
        self.fallback_active.store(true, Ordering::SeqCst);
        drop(active);

        let failed = Arc::clone(failed);
        tokio::spawn(async move {
            if let Err(e) = failed.disconnect().await {
                warn!(error = %e, "Failed to disconnect abandoned backend");
            }
        });

        info!(migrated = count, "Switched to in-memory pub/sub backend");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), PubSubError> {
        self.current().await.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.current().await.is_connected()
    }

    /// Whether the broker has abandoned the configured backend
    pub fn is_fallback_active(&self) -> bool {
        self.fallback_active.load(Ordering::SeqCst)
    }

    /// Publish `data` on `topic` and return the envelope id.
    ///
    /// Publishing to a topic nobody listens to is not an error.
    #[instrument(skip(self, data, metadata), level = "debug")]
    pub async fn publish(
        &self,
        topic: &str,
        data: serde_json::Value,
        metadata: Option<Metadata>,
    ) -> Result<Uuid, PubSubError> {
        validate_topic(topic).map_err(|e| PubSubError::InvalidTopic(e.client_message()))?;

        let message = PubSubMessage::new(topic, data, metadata);
        let backend = self.current().await;
        match backend.publish(&message).await {
            Ok(()) => Ok(message.message_id),
            Err(e) if backend.is_distributed() => {
                warn!(
                    backend = backend.name(),
                    error = %e,
                    "Publish failed, falling back to in-memory delivery"
                );
                self.fall_back(&backend).await?;
                self.current().await.publish(&message).await?;
                Ok(message.message_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Register `sender` for every topic matching `pattern`
    pub async fn subscribe(
        &self,
        pattern: &str,
        sender: MessageSender,
    ) -> Result<SubscriptionId, PubSubError> {
        validate_pattern(pattern).map_err(|e| PubSubError::InvalidPattern(e.client_message()))?;

        let subscription = Subscription::new(pattern, sender);
        let id = subscription.id;
        let backend = self.backend.read().await;
        backend.subscribe(subscription).await?;
        Ok(id)
    }

    /// Subscribe with a fresh channel and hand back its receiving side
    pub async fn subscribe_channel(
        &self,
        pattern: &str,
    ) -> Result<(SubscriptionId, MessageReceiver), PubSubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(pattern, tx).await?;
        Ok((id, rx))
    }

    /// Remove one subscription. Returns false if it was unknown.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, PubSubError> {
        let backend = self.backend.read().await;
        backend.unsubscribe(id).await
    }

    pub async fn unsubscribe_all(&self, pattern: &str) -> Result<usize, PubSubError> {
        let backend = self.backend.read().await;
        backend.unsubscribe_all(pattern).await
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.current()
            .await
            .subscriptions()
            .iter()
            .map(Subscription::info)
            .collect()
    }

    pub async fn subscription_count(&self, pattern: Option<&str>) -> usize {
        self.current().await.subscription_count(pattern)
    }

    pub async fn clear(&self) -> Result<(), PubSubError> {
        let backend = self.backend.read().await;
        backend.clear().await
    }

    pub async fn stats(&self) -> PubSubStats {
        let mut stats = self.current().await.stats();
        stats.fallback_active = self.is_fallback_active();
        stats
    }

    /// Name of the backend currently carrying traffic
    pub async fn backend_name(&self) -> &'static str {
        self.current().await.name()
    }
}

impl std::fmt::Debug for PubSubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubBroker")
            .field("fallback_active", &self.is_fallback_active())
            .finish_non_exhaustive()
    }
}
