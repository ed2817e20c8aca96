//! Redis Delivery Backend
//!
//! Envelopes travel as JSON on channel `<prefix><topic>`. Every local pattern
//! is `PSUBSCRIBE`d as a Redis glob (reference counted per glob) and a single
//! listener task redispatches incoming envelopes to the local subscription
//! table, which re-checks the exact pattern semantics.
//!
//! Redis sends one `pmessage` per matching glob, so a publish can arrive
//! several times when globs overlap. Each copy is delivered only to the
//! subscriptions registered under the glob it arrived on.
//!
//! Ordering: Redis delivers the messages of one publishing connection in
//! order, so successive publishes to one topic from one node arrive in order.
//! Nothing is guaranteed across publishing nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{
    DeliveryBackend, PubSubError, PubSubMessage, PubSubStats, Subscription, SubscriptionId,
    SubscriptionTable,
};
use crate::config::PubSubSettings;
use crate::infrastructure::metrics;

/// Live Redis handles
struct RedisLink {
    publisher: ConnectionManager,
    sink: PubSubSink,
    listener: JoinHandle<()>,
}

/// Redis-backed distributed backend
pub struct RedisBackend {
    url: String,
    channel_prefix: String,
    connect_timeout: Duration,
    table: Arc<SubscriptionTable>,
    link: Mutex<Option<RedisLink>>,
    /// Redis glob -> number of local subscriptions using it
    globs: Mutex<HashMap<String, usize>>,
    connected: Arc<AtomicBool>,
}

impl RedisBackend {
    pub const NAME: &'static str = "redis";

    pub fn new(settings: &PubSubSettings) -> Self {
        Self {
            url: settings.redis_url.clone(),
            channel_prefix: settings.channel_prefix.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            table: Arc::new(SubscriptionTable::new()),
            link: Mutex::new(None),
            globs: Mutex::new(HashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}{}", self.channel_prefix, topic)
    }

    async fn open_link(&self) -> Result<RedisLink, PubSubError> {
        let client = Client::open(self.url.as_str())?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let (sink, mut stream) = client.get_async_pubsub().await?.split();

        let table = Arc::clone(&self.table);
        let connected = Arc::clone(&self.connected);
        let prefix = self.channel_prefix.clone();
        let listener = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let glob: Option<String> = msg.get_pattern().unwrap_or(None);
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Dropping non-text Redis payload");
                        continue;
                    }
                };
                match serde_json::from_str::<PubSubMessage>(&payload) {
                    Ok(envelope) => match glob {
                        Some(glob) => {
                            table.dispatch_where(&envelope, |s| {
                                s.pattern.to_redis_glob(&prefix) == glob
                            });
                        }
                        None => {
                            table.dispatch(&envelope);
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable Redis envelope");
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            warn!("Redis pub/sub stream ended");
        });

        Ok(RedisLink {
            publisher,
            sink,
            listener,
        })
    }

    /// Take a reference on a glob, subscribing in Redis on first use
    async fn acquire_glob(&self, glob: &str) -> Result<(), PubSubError> {
        let mut globs = self.globs.lock().await;
        let count = globs.entry(glob.to_string()).or_insert(0);
        if *count == 0 {
            let mut link = self.link.lock().await;
            let link = link.as_mut().ok_or(PubSubError::NotConnected)?;
            link.sink.psubscribe(glob).await?;
            debug!(glob = %glob, "Redis pattern subscribed");
        }
        *count += 1;
        Ok(())
    }

    /// Drop a reference on a glob, unsubscribing in Redis on last use
    async fn release_glob(&self, glob: &str) {
        let mut globs = self.globs.lock().await;
        let Some(count) = globs.get_mut(glob) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return;
        }
        globs.remove(glob);

        let mut link = self.link.lock().await;
        if let Some(link) = link.as_mut() {
            if let Err(e) = link.sink.punsubscribe(glob).await {
                warn!(glob = %glob, error = %e, "Failed to release Redis pattern");
            }
        }
    }

    fn glob_for(&self, subscription: &Subscription) -> String {
        subscription.pattern.to_redis_glob(&self.channel_prefix)
    }
}

#[async_trait]
impl DeliveryBackend for RedisBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_distributed(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&self) -> Result<(), PubSubError> {
        info!("Connecting to Redis pub/sub...");
        let link = tokio::time::timeout(self.connect_timeout, self.open_link())
            .await
            .map_err(|_| {
                PubSubError::Unavailable(format!(
                    "connection timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        if let Some(old) = self.link.lock().await.replace(link) {
            old.listener.abort();
        }

        // Re-establish patterns for subscriptions registered before connecting
        let globs: Vec<String> = self.globs.lock().await.keys().cloned().collect();
        {
            let mut link = self.link.lock().await;
            if let Some(link) = link.as_mut() {
                for glob in globs {
                    link.sink.psubscribe(&glob).await?;
                }
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        info!("Redis pub/sub connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PubSubError> {
        if let Some(link) = self.link.lock().await.take() {
            link.listener.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Redis pub/sub disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, message), fields(topic = %message.topic), level = "debug")]
    async fn publish(&self, message: &PubSubMessage) -> Result<(), PubSubError> {
        if !self.is_connected() {
            return Err(PubSubError::NotConnected);
        }
        let payload = serde_json::to_string(message)?;
        let mut publisher = {
            let link = self.link.lock().await;
            link.as_ref()
                .map(|l| l.publisher.clone())
                .ok_or(PubSubError::NotConnected)?
        };

        let _: () = publisher.publish(self.channel(&message.topic), payload).await?;
        self.table.record_published();
        metrics::record_publish(Self::NAME);
        debug!(message_id = %message.message_id, "Message published to Redis");
        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<(), PubSubError> {
        let glob = self.glob_for(&subscription);
        if self.is_connected() {
            self.acquire_glob(&glob).await?;
        } else {
            // Subscribed in Redis on the next successful connect
            *self.globs.lock().await.entry(glob).or_insert(0) += 1;
        }
        self.table.insert(subscription);
        Ok(())
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, PubSubError> {
        match self.table.remove(id) {
            Some(subscription) => {
                self.release_glob(&self.glob_for(&subscription)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn unsubscribe_all(&self, pattern: &str) -> Result<usize, PubSubError> {
        let removed = self.table.remove_pattern(pattern);
        for subscription in &removed {
            self.release_glob(&self.glob_for(subscription)).await;
        }
        Ok(removed.len())
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.table.snapshot()
    }

    fn subscription_count(&self, pattern: Option<&str>) -> usize {
        self.table.count(pattern)
    }

    async fn clear(&self) -> Result<(), PubSubError> {
        for subscription in self.table.drain() {
            self.release_glob(&self.glob_for(&subscription)).await;
        }
        Ok(())
    }

    fn stats(&self) -> PubSubStats {
        self.table.stats(Self::NAME, self.is_connected())
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.listener.abort();
        }
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("channel_prefix", &self.channel_prefix)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
