//! Connection Manager
//!
//! Owns the live connections of one transport and keeps four indexes
//! mutually consistent: by id, by authenticated user, by source IP and by
//! subscribed topic.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionId, ConnectionUser, Outbound};
use crate::config::ConnectionSettings;
use crate::domain::PublicUser;
use crate::infrastructure::metrics;
use crate::infrastructure::pubsub::SubscriptionId;
use crate::shared::error::AppError;

/// Connection bookkeeping errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Too many connections from {ip} (limit {limit})")]
    PerIpLimit { ip: IpAddr, limit: usize },

    #[error("Server connection limit reached ({0})")]
    GlobalLimit(usize),

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection already authenticated")]
    AlreadyAuthenticated,

    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),
}

impl From<ConnectionError> for AppError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::PerIpLimit { .. } | ConnectionError::GlobalLimit(_) => {
                AppError::ResourceLimit(err.to_string())
            }
            ConnectionError::UnknownConnection(_) => AppError::NotFound(err.to_string()),
            ConnectionError::AlreadyAuthenticated | ConnectionError::AlreadySubscribed(_) => {
                AppError::Conflict(err.to_string())
            }
        }
    }
}

/// Admission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_per_ip: usize,
    /// 0 = unlimited
    pub max_connections: usize,
}

impl From<&ConnectionSettings> for ConnectionLimits {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            max_per_ip: settings.max_per_ip,
            max_connections: settings.max_connections,
        }
    }
}

/// How a transport decides that a connection is dead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No inbound traffic for this long (TCP)
    IdleTimeout(Duration),
    /// This many consecutive pings left unanswered (WebSocket)
    MissedPongs(u32),
}

impl Liveness {
    fn is_stale<M>(&self, connection: &Connection<M>) -> bool {
        match *self {
            Liveness::IdleTimeout(max_idle) => connection.idle_for() > max_idle,
            Liveness::MissedPongs(max_missed) => connection.missed_pongs() >= max_missed,
        }
    }
}

/// Connection registry of one transport
pub struct ConnectionManager<M> {
    transport: &'static str,
    limits: ConnectionLimits,
    connections: DashMap<ConnectionId, Arc<Connection<M>>>,
    by_user: DashMap<i64, HashSet<ConnectionId>>,
    by_ip: DashMap<IpAddr, HashSet<ConnectionId>>,
    by_topic: DashMap<String, HashSet<ConnectionId>>,
    total: AtomicUsize,
    authenticated: AtomicUsize,
}

impl<M: Send + 'static> ConnectionManager<M> {
    pub fn new(transport: &'static str, limits: ConnectionLimits) -> Self {
        Self {
            transport,
            limits,
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_ip: DashMap::new(),
            by_topic: DashMap::new(),
            total: AtomicUsize::new(0),
            authenticated: AtomicUsize::new(0),
        }
    }

    pub fn transport(&self) -> &'static str {
        self.transport
    }

    /// Admit a new connection from `remote_addr`.
    ///
    /// The per-IP count is checked and updated under the IP entry lock, so
    /// a rejected connection leaves every index untouched.
    pub fn add_connection(
        &self,
        remote_addr: SocketAddr,
    ) -> Result<(Arc<Connection<M>>, mpsc::UnboundedReceiver<Outbound<M>>), ConnectionError> {
        let ip = remote_addr.ip();
        let (connection, receiver) = Connection::new(remote_addr);
        let connection = Arc::new(connection);

        let entry = self.by_ip.entry(ip);
        let from_ip = match &entry {
            Entry::Occupied(e) => e.get().len(),
            Entry::Vacant(_) => 0,
        };
        if from_ip >= self.limits.max_per_ip {
            metrics::record_rejected_connection(self.transport, "per_ip");
            return Err(ConnectionError::PerIpLimit {
                ip,
                limit: self.limits.max_per_ip,
            });
        }
        self.reserve_slot()?;
        entry.or_default().insert(connection.id.clone());

        self.connections
            .insert(connection.id.clone(), Arc::clone(&connection));
        self.update_gauges();

        tracing::debug!(
            transport = self.transport,
            connection_id = %connection.id,
            remote_addr = %remote_addr,
            "Connection registered"
        );
        Ok((connection, receiver))
    }

    fn reserve_slot(&self) -> Result<(), ConnectionError> {
        let max = self.limits.max_connections;
        if max == 0 {
            self.total.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                metrics::record_rejected_connection(self.transport, "global");
                ConnectionError::GlobalLimit(max)
            })
    }

    /// Forget a connection and every index entry pointing at it.
    ///
    /// Idempotent: unknown ids are a no-op returning `None`.
    pub fn remove_connection(&self, id: &str) -> Option<Arc<Connection<M>>> {
        let (_, connection) = self.connections.remove(id)?;
        self.total.fetch_sub(1, Ordering::SeqCst);

        let ip = connection.remote_addr.ip();
        if let Some(mut ids) = self.by_ip.get_mut(&ip) {
            ids.remove(id);
        }
        self.by_ip.remove_if(&ip, |_, ids| ids.is_empty());

        if let Some(user_id) = connection.user_id() {
            self.unindex_user(user_id, id);
            self.authenticated.fetch_sub(1, Ordering::SeqCst);
        }

        for topic in connection.take_topics().into_keys() {
            self.unindex_topic(&topic, id);
        }

        self.update_gauges();
        tracing::debug!(
            transport = self.transport,
            connection_id = %id,
            "Connection removed"
        );
        Some(connection)
    }

    fn unindex_user(&self, user_id: i64, id: &str) {
        if let Some(mut ids) = self.by_user.get_mut(&user_id) {
            ids.remove(id);
        }
        self.by_user.remove_if(&user_id, |_, ids| ids.is_empty());
    }

    fn unindex_topic(&self, topic: &str, id: &str) {
        if let Some(mut ids) = self.by_topic.get_mut(topic) {
            ids.remove(id);
        }
        self.by_topic.remove_if(topic, |_, ids| ids.is_empty());
    }

    /// Attach an identity to a connection. A connection authenticates once.
    pub fn authenticate_connection(
        &self,
        id: &str,
        user_id: i64,
        email: Option<String>,
        profile: Option<PublicUser>,
    ) -> Result<(), ConnectionError> {
        let connection = self
            .get(id)
            .ok_or_else(|| ConnectionError::UnknownConnection(id.to_string()))?;

        let user = ConnectionUser {
            user_id,
            email,
            profile,
        };
        if !connection.set_user(user) {
            return Err(ConnectionError::AlreadyAuthenticated);
        }

        self.by_user
            .entry(user_id)
            .or_default()
            .insert(id.to_string());
        self.authenticated.fetch_add(1, Ordering::SeqCst);

        // Lost a race with remove_connection
        if !self.connections.contains_key(id) {
            self.unindex_user(user_id, id);
            self.authenticated.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::UnknownConnection(id.to_string()));
        }

        self.update_gauges();
        tracing::info!(
            transport = self.transport,
            connection_id = %id,
            user_id,
            "Connection authenticated"
        );
        Ok(())
    }

    /// Record that `id` is subscribed to `topic` through broker subscription
    /// `subscription_id`
    pub fn add_subscription(
        &self,
        id: &str,
        topic: &str,
        subscription_id: SubscriptionId,
    ) -> Result<(), ConnectionError> {
        let connection = self
            .get(id)
            .ok_or_else(|| ConnectionError::UnknownConnection(id.to_string()))?;
        if !connection.insert_topic(topic, subscription_id) {
            return Err(ConnectionError::AlreadySubscribed(topic.to_string()));
        }
        self.by_topic
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string());

        if !self.connections.contains_key(id) {
            self.unindex_topic(topic, id);
            return Err(ConnectionError::UnknownConnection(id.to_string()));
        }
        Ok(())
    }

    /// Drop the subscription of `id` to `topic`, returning its broker id
    pub fn remove_subscription(&self, id: &str, topic: &str) -> Option<SubscriptionId> {
        let subscription_id = self.get(id)?.remove_topic(topic)?;
        self.unindex_topic(topic, id);
        Some(subscription_id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection<M>>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Queue a message for one connection. False if unknown or not writable.
    pub fn send_to_connection(&self, id: &str, message: M) -> bool {
        match self.connections.get(id) {
            Some(connection) => connection.send(message),
            None => false,
        }
    }

    /// Ids of the connections of one user
    pub fn connections_for_user(&self, user_id: i64) -> Vec<ConnectionId> {
        self.by_user
            .get(&user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connections_for_ip(&self, ip: IpAddr) -> usize {
        self.by_ip.get(&ip).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Number of connections subscribed to exactly `topic`
    pub fn topic_subscribers(&self, topic: &str) -> usize {
        self.by_topic.get(topic).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn authenticated_count(&self) -> usize {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Ping every connection, counting each ping as unanswered until a pong
    pub fn ping_all(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|connection| connection.ping())
            .count()
    }

    /// Close and forget every connection that `policy` considers dead.
    ///
    /// Closing is only requested, never awaited.
    pub fn remove_stale_connections(&self, policy: Liveness) -> usize {
        let stale: Vec<Arc<Connection<M>>> = self
            .snapshot()
            .into_iter()
            .filter(|connection| policy.is_stale(connection))
            .collect();

        for connection in &stale {
            tracing::info!(
                transport = self.transport,
                connection_id = %connection.id,
                idle_ms = connection.idle_for().as_millis() as u64,
                missed_pongs = connection.missed_pongs(),
                "Evicting stale connection"
            );
            connection.close();
            self.remove_connection(&connection.id);
        }
        stale.len()
    }

    /// Close every connection, waiting at most `timeout` for each one.
    ///
    /// Always completes, even if no socket acknowledges.
    pub async fn close_all(&self, timeout: Duration) {
        let connections = self.snapshot();
        let count = connections.len();

        let closes = connections.iter().map(|connection| {
            let ack = connection.close_with_ack();
            async move {
                if tokio::time::timeout(timeout, ack).await.is_err() {
                    tracing::debug!(connection_id = %connection.id, "Close timed out");
                }
            }
        });
        join_all(closes).await;

        for connection in connections {
            self.remove_connection(&connection.id);
        }
        tracing::info!(
            transport = self.transport,
            closed = count,
            "All connections closed"
        );
    }

    fn snapshot(&self) -> Vec<Arc<Connection<M>>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn update_gauges(&self) {
        metrics::set_connections(
            self.transport,
            self.connection_count(),
            self.authenticated_count(),
        );
    }
}

impl<M: Clone + Send + 'static> ConnectionManager<M> {
    /// Send to every connection; returns the number of successful sends
    pub fn broadcast(&self, message: M) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().send(message.clone()))
            .count()
    }

    /// Send to every connection subscribed to exactly `topic`
    pub fn broadcast_to_topic(&self, topic: &str, message: M) -> usize {
        let ids: Vec<ConnectionId> = match self.by_topic.get(topic) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return 0,
        };
        ids.iter()
            .filter(|id| self.send_to_connection(id, message.clone()))
            .count()
    }
}

impl<M> std::fmt::Debug for ConnectionManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.transport)
            .field("limits", &self.limits)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
