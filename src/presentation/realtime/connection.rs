//! Connection State
//!
//! One live transport session, shared between its reader task, its writer
//! task and the connection manager indexes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

use crate::domain::PublicUser;
use crate::infrastructure::pubsub::SubscriptionId;

/// Opaque connection id, unique per accepted socket
pub type ConnectionId = String;

/// Instruction for a connection's writer task
#[derive(Debug)]
pub enum Outbound<M> {
    /// Write one transport message
    Message(M),
    /// Transport-level keep-alive probe
    Ping,
    /// Flush, close the socket, then acknowledge
    Close(Option<oneshot::Sender<()>>),
}

/// Identity attached by a successful auth
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionUser {
    pub user_id: i64,
    pub email: Option<String>,
    /// Cached public projection, if the user directory knows the user
    pub profile: Option<PublicUser>,
}

/// Live connection
#[derive(Debug)]
pub struct Connection<M> {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    user: RwLock<Option<ConnectionUser>>,
    /// Subscribed topic -> broker subscription id
    topics: Mutex<HashMap<String, SubscriptionId>>,
    missed_pongs: AtomicU32,
    closing: AtomicBool,
    close_signal: Notify,
    sender: mpsc::UnboundedSender<Outbound<M>>,
}

impl<M> Connection<M> {
    /// Create a connection and the receiving end of its outbound queue
    pub fn new(remote_addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound<M>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            user: RwLock::new(None),
            topics: Mutex::new(HashMap::new()),
            missed_pongs: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            close_signal: Notify::new(),
            sender,
        };
        (connection, receiver)
    }

    /// Queue a message for the writer task.
    ///
    /// Returns false once the writer is gone. A failed send removes no state.
    pub fn send(&self, message: M) -> bool {
        self.sender.send(Outbound::Message(message)).is_ok()
    }

    /// Queue a transport-level ping and count it as unanswered
    pub fn ping(&self) -> bool {
        self.missed_pongs.fetch_add(1, Ordering::SeqCst);
        self.sender.send(Outbound::Ping).is_ok()
    }

    pub fn record_pong(&self) {
        self.missed_pongs.store(0, Ordering::SeqCst);
        self.touch();
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::SeqCst)
    }

    /// Mark inbound traffic
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn user(&self) -> Option<ConnectionUser> {
        self.user.read().clone()
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user.read().as_ref().map(|u| u.user_id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.read().is_some()
    }

    /// Attach an identity. Returns false if one is already attached.
    pub(super) fn set_user(&self, user: ConnectionUser) -> bool {
        let mut slot = self.user.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(user);
        true
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    pub(super) fn insert_topic(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics.lock();
        if topics.contains_key(topic) {
            return false;
        }
        topics.insert(topic.to_string(), id);
        true
    }

    pub(super) fn remove_topic(&self, topic: &str) -> Option<SubscriptionId> {
        self.topics.lock().remove(topic)
    }

    pub(super) fn take_topics(&self) -> HashMap<String, SubscriptionId> {
        std::mem::take(&mut *self.topics.lock())
    }

    /// Ask the transport to tear this connection down.
    ///
    /// Never waits: the writer flushes and closes the socket, the reader
    /// loop observes [`Connection::closed`] and runs its disconnect path.
    pub fn close(&self) {
        self.request_close(None);
    }

    /// Like [`Connection::close`], with an acknowledgment once the socket
    /// has been closed by the writer
    pub fn close_with_ack(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.request_close(Some(tx));
        rx
    }

    fn request_close(&self, ack: Option<oneshot::Sender<()>>) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.sender.send(Outbound::Close(ack));
        self.close_signal.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once a close has been requested
    pub async fn closed(&self) {
        if self.is_closing() {
            return;
        }
        self.close_signal.notified().await;
    }
}
