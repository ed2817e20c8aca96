//! Session Handler
//!
//! Per-connection protocol state machine shared by both transports:
//! `Unauthenticated -> Authenticated`. Only `auth` is accepted before
//! authentication; every error is turned into a reply and the connection
//! stays open.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    Command, Connection, ConnectionId, ConnectionManager, Outbound, Reply, Transport,
};
use crate::domain::{AuthVerifier, UserLookup};
use crate::infrastructure::metrics;
use crate::infrastructure::pubsub::{Metadata, PubSubBroker, SubscriptionId};
use crate::shared::error::AppError;

/// Broker subscription owned by one connection
struct ActiveSubscription {
    id: SubscriptionId,
    forwarder: JoinHandle<()>,
}

/// Drives connection state and broker operations for one transport
pub struct SessionHandler<T: Transport> {
    manager: Arc<ConnectionManager<T::Outgoing>>,
    broker: Arc<PubSubBroker>,
    auth: Arc<dyn AuthVerifier>,
    users: Arc<dyn UserLookup>,
    /// Connection -> topic -> broker subscription. The broker id, not the
    /// topic, is what unsubscribes.
    subscriptions: DashMap<ConnectionId, HashMap<String, ActiveSubscription>>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: Transport> SessionHandler<T> {
    pub fn new(
        manager: Arc<ConnectionManager<T::Outgoing>>,
        broker: Arc<PubSubBroker>,
        auth: Arc<dyn AuthVerifier>,
        users: Arc<dyn UserLookup>,
    ) -> Self {
        Self {
            manager,
            broker,
            auth,
            users,
            subscriptions: DashMap::new(),
            _transport: PhantomData,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<T::Outgoing>> {
        &self.manager
    }

    /// Register a freshly accepted socket
    pub fn open(
        &self,
        remote_addr: SocketAddr,
    ) -> Result<
        (
            Arc<Connection<T::Outgoing>>,
            mpsc::UnboundedReceiver<Outbound<T::Outgoing>>,
        ),
        AppError,
    > {
        match self.manager.add_connection(remote_addr) {
            Ok(opened) => {
                info!(
                    transport = T::NAME,
                    connection_id = %opened.0.id,
                    remote_addr = %remote_addr,
                    "Client connected"
                );
                Ok(opened)
            }
            Err(e) => {
                warn!(
                    transport = T::NAME,
                    remote_addr = %remote_addr,
                    error = %e,
                    "Connection refused"
                );
                Err(e.into())
            }
        }
    }

    /// Process one decoded client command and send its reply, if any
    pub async fn handle(&self, connection: &Arc<Connection<T::Outgoing>>, command: Command) {
        connection.touch();
        metrics::record_protocol_message(T::NAME, command.name());

        match self.dispatch(connection, command).await {
            Ok(Some(reply)) => {
                self.reply(connection, reply);
            }
            Ok(None) => {}
            Err(err) => self.reject(connection, &err),
        }
    }

    /// Send an error reply for `err`
    pub fn reject(&self, connection: &Connection<T::Outgoing>, err: &AppError) {
        match err {
            AppError::Internal(_) | AppError::Backend(_) | AppError::Redis(_) => {
                error!(connection_id = %connection.id, error = %err, "Command failed");
            }
            _ => {
                debug!(connection_id = %connection.id, error = %err, "Command rejected");
            }
        }
        self.reply(connection, Reply::from_error(err));
    }

    pub fn reply(&self, connection: &Connection<T::Outgoing>, reply: Reply) -> bool {
        connection.send(T::render(reply))
    }

    async fn dispatch(
        &self,
        connection: &Arc<Connection<T::Outgoing>>,
        command: Command,
    ) -> Result<Option<Reply>, AppError> {
        if let Command::Auth { token } = command {
            return self.authenticate(connection, &token).await;
        }

        let user_id = connection
            .user_id()
            .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))?;

        match command {
            Command::Subscribe { topic } => self.subscribe(connection, topic).await,
            Command::Unsubscribe { topic } => self.unsubscribe(connection, topic).await,
            Command::Publish {
                topic,
                data,
                metadata,
            } => {
                let mut sender = Metadata::new();
                sender.insert("senderId".into(), json!(user_id));
                sender.insert("senderConnectionId".into(), json!(connection.id));
                let metadata = merge_metadata(metadata, sender);
                let message_id = self.broker.publish(&topic, data, Some(metadata)).await?;
                debug!(
                    connection_id = %connection.id,
                    topic = %topic,
                    message_id = %message_id,
                    "Client message published"
                );
                Ok(None)
            }
            Command::Ping => Ok(Some(Reply::Pong)),
            Command::Pong => {
                connection.record_pong();
                Ok(None)
            }
            Command::Auth { .. } => Ok(None),
        }
    }

    async fn authenticate(
        &self,
        connection: &Connection<T::Outgoing>,
        token: &str,
    ) -> Result<Option<Reply>, AppError> {
        if connection.is_authenticated() {
            return Err(AppError::Conflict("Connection already authenticated".into()));
        }

        let identity = self.auth.verify(token).await?;
        let profile = match self.users.find_by_id(identity.user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user_id = identity.user_id, error = %e, "User lookup failed");
                None
            }
        };

        self.manager.authenticate_connection(
            &connection.id,
            identity.user_id,
            identity.email,
            profile,
        )?;
        Ok(Some(Reply::AuthSuccess {
            user_id: identity.user_id,
        }))
    }

    async fn subscribe(
        &self,
        connection: &Connection<T::Outgoing>,
        topic: String,
    ) -> Result<Option<Reply>, AppError> {
        let already = self
            .subscriptions
            .get(&connection.id)
            .map(|topics| topics.contains_key(&topic))
            .unwrap_or(false);
        if already {
            return Err(AppError::Conflict(format!("Already subscribed to {}", topic)));
        }

        let (sender, mut deliveries) = mpsc::unbounded_channel();
        let subscription_id = self.broker.subscribe(&topic, sender).await?;

        let manager = Arc::clone(&self.manager);
        let connection_id = connection.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(envelope) = deliveries.recv().await {
                if !manager.send_to_connection(&connection_id, T::render(Reply::Delivery(envelope)))
                {
                    debug!(connection_id = %connection_id, "Delivery to closed connection dropped");
                }
            }
        });

        if let Err(e) = self
            .manager
            .add_subscription(&connection.id, &topic, subscription_id)
        {
            forwarder.abort();
            if let Err(e) = self.broker.unsubscribe(subscription_id).await {
                warn!(error = %e, "Failed to roll back subscription");
            }
            return Err(e.into());
        }

        self.subscriptions
            .entry(connection.id.clone())
            .or_default()
            .insert(
                topic.clone(),
                ActiveSubscription {
                    id: subscription_id,
                    forwarder,
                },
            );

        debug!(
            connection_id = %connection.id,
            topic = %topic,
            subscription_id = %subscription_id,
            "Subscribed"
        );
        Ok(Some(Reply::Subscribed { topic }))
    }

    async fn unsubscribe(
        &self,
        connection: &Connection<T::Outgoing>,
        topic: String,
    ) -> Result<Option<Reply>, AppError> {
        let active = self
            .subscriptions
            .get_mut(&connection.id)
            .and_then(|mut topics| topics.remove(&topic))
            .ok_or_else(|| AppError::NotFound(format!("Not subscribed to {}", topic)))?;

        active.forwarder.abort();
        self.manager.remove_subscription(&connection.id, &topic);
        self.broker.unsubscribe(active.id).await?;

        debug!(connection_id = %connection.id, topic = %topic, "Unsubscribed");
        Ok(Some(Reply::Unsubscribed { topic }))
    }

    /// Tear down everything a connection owns. Safe to call more than once.
    ///
    /// Every broker subscription of the connection is released before the
    /// connection leaves the manager, so nothing keeps delivering to a dead
    /// socket.
    pub async fn disconnect(&self, connection_id: &str) {
        let owned = self
            .subscriptions
            .remove(connection_id)
            .map(|(_, topics)| topics)
            .unwrap_or_default();
        let count = owned.len();

        for (topic, active) in owned {
            active.forwarder.abort();
            if let Err(e) = self.broker.unsubscribe(active.id).await {
                warn!(
                    connection_id = %connection_id,
                    topic = %topic,
                    error = %e,
                    "Failed to release subscription"
                );
            }
        }

        if let Some(connection) = self.manager.remove_connection(connection_id) {
            info!(
                transport = T::NAME,
                connection_id = %connection_id,
                user_id = ?connection.user_id(),
                subscriptions = count,
                "Client disconnected"
            );
        }
    }

    /// Topics a connection is subscribed to through this handler
    pub fn subscribed_topics(&self, connection_id: &str) -> Vec<String> {
        self.subscriptions
            .get(connection_id)
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl<T: Transport> std::fmt::Debug for SessionHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandler")
            .field("transport", &T::NAME)
            .field("connections", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

/// Fold sender fields into client-supplied metadata; sender fields win
pub fn merge_metadata(base: Option<Metadata>, extra: Metadata) -> Metadata {
    let mut merged = base.unwrap_or_default();
    merged.extend(extra);
    merged
}
