//! Subscription Table
//!
//! Local subscription registry and fan-out shared by both backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{PubSubMessage, PubSubStats, Subscription, SubscriptionId};
use crate::infrastructure::metrics;

/// Local subscriptions plus delivery counters
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscription: Subscription) {
        self.subscriptions.write().insert(subscription.id, subscription);
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.write().remove(&id)
    }

    /// Remove every subscription whose pattern equals `pattern`
    pub fn remove_pattern(&self, pattern: &str) -> Vec<Subscription> {
        let mut subscriptions = self.subscriptions.write();
        let ids: Vec<SubscriptionId> = subscriptions
            .values()
            .filter(|s| s.pattern.as_str() == pattern)
            .map(|s| s.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| subscriptions.remove(&id))
            .collect()
    }

    pub fn drain(&self) -> Vec<Subscription> {
        self.subscriptions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, pattern: Option<&str>) -> usize {
        match pattern {
            None => self.len(),
            Some(pattern) => self
                .subscriptions
                .read()
                .values()
                .filter(|s| s.pattern.as_str() == pattern)
                .count(),
        }
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Deliver a message to every matching subscription.
    ///
    /// The lock is only held while collecting recipients. A closed receiver
    /// counts as a failed delivery and never affects the other recipients.
    /// Returns the number of successful deliveries.
    pub fn dispatch(&self, message: &PubSubMessage) -> usize {
        self.dispatch_where(message, |_| true)
    }

    /// Like [`dispatch`](Self::dispatch), restricted to the matching
    /// subscriptions that also satisfy `select`
    pub fn dispatch_where<F>(&self, message: &PubSubMessage, select: F) -> usize
    where
        F: Fn(&Subscription) -> bool,
    {
        let recipients: Vec<(SubscriptionId, super::MessageSender)> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.pattern.matches(&message.topic) && select(s))
            .map(|s| (s.id, s.sender.clone()))
            .collect();

        if recipients.is_empty() {
            tracing::trace!(topic = %message.topic, "No subscribers for topic");
            return 0;
        }

        let envelope = Arc::new(message.clone());
        let mut delivered = 0;
        for (id, sender) in recipients {
            match sender.send(Arc::clone(&envelope)) {
                Ok(()) => {
                    delivered += 1;
                    metrics::record_delivery(true);
                }
                Err(_) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::record_delivery(false);
                    tracing::warn!(
                        subscription_id = %id,
                        topic = %message.topic,
                        "Subscriber channel closed, delivery dropped"
                    );
                }
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Counter snapshot. Backend-specific fields are filled in by the caller.
    pub fn stats(&self, backend: &'static str, connected: bool) -> PubSubStats {
        PubSubStats {
            backend,
            connected,
            fallback_active: false,
            subscriptions: self.len(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
