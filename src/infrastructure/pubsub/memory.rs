//! In-Process Delivery Backend
//!
//! Keeps every subscription in memory and fans out synchronously on the
//! publishing task. Per-subscriber channels preserve publish order.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{
    DeliveryBackend, PubSubError, PubSubMessage, PubSubStats, Subscription, SubscriptionId,
    SubscriptionTable,
};
use crate::infrastructure::metrics;

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    table: SubscriptionTable,
    connected: AtomicBool,
}

impl MemoryBackend {
    pub const NAME: &'static str = "memory";

    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_distributed(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), PubSubError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("In-memory pub/sub backend ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PubSubError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, message), fields(topic = %message.topic), level = "debug")]
    async fn publish(&self, message: &PubSubMessage) -> Result<(), PubSubError> {
        self.table.record_published();
        metrics::record_publish(Self::NAME);
        let delivered = self.table.dispatch(message);
        debug!(message_id = %message.message_id, delivered, "Message published");
        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<(), PubSubError> {
        debug!(
            subscription_id = %subscription.id,
            pattern = %subscription.pattern,
            "Subscription added"
        );
        self.table.insert(subscription);
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, PubSubError> {
        Ok(self.table.remove(id).is_some())
    }

    async fn unsubscribe_all(&self, pattern: &str) -> Result<usize, PubSubError> {
        Ok(self.table.remove_pattern(pattern).len())
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.table.snapshot()
    }

    fn subscription_count(&self, pattern: Option<&str>) -> usize {
        self.table.count(pattern)
    }

    async fn clear(&self) -> Result<(), PubSubError> {
        self.table.drain();
        Ok(())
    }

    fn stats(&self) -> PubSubStats {
        self.table.stats(Self::NAME, self.is_connected())
    }
}
