//! Common Test Utilities
//!
//! Settings, JWTs, a spawned server and a minimal binary protocol client.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use config::Config;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use realtime_server::config::Settings;
use realtime_server::presentation::realtime::payloads::AuthPayload;
use realtime_server::presentation::tcp::{FrameParser, TcpMessage};
use realtime_server::startup::{AppState, Application};

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";

/// How long a test waits for an expected message
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory backend, loopback listeners on ephemeral ports
pub fn test_settings() -> Settings {
    Settings::defaults(Config::builder(), "test")
        .and_then(|builder| builder.set_override("server.host", "127.0.0.1"))
        .and_then(|builder| builder.set_override("server.port", 0))
        .and_then(|builder| builder.set_override("tcp.host", "127.0.0.1"))
        .and_then(|builder| builder.set_override("tcp.port", 0))
        .and_then(|builder| builder.set_override("jwt.secret", TEST_SECRET))
        .and_then(|builder| builder.build())
        .and_then(|config| config.try_deserialize())
        .expect("Failed to build test settings")
}

/// Sign a token for `user_id` with the test secret
pub fn token_for(user_id: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "sub": user_id.to_string(),
        "iat": now,
        "exp": now + 3600,
        "email": format!("user{}@example.com", user_id),
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("Failed to sign test token")
}

/// A running server
pub struct TestApp {
    pub http_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_settings()).await
    }

    pub async fn spawn_with(settings: Settings) -> Self {
        let app = Application::build(settings)
            .await
            .expect("Failed to build application");
        let http_addr = app.local_addr().expect("No HTTP address");
        let tcp_addr = app.tcp_addr().expect("No TCP address");
        let state = app.state().clone();

        let (shutdown, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(app.run_until(async move {
            let _ = stopped.await;
        }));

        Self {
            http_addr,
            tcp_addr,
            state,
            shutdown: Some(shutdown),
            server,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.http_addr)
    }

    /// Trigger graceful shutdown and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(Duration::from_secs(10), &mut self.server)
            .await
            .expect("Shutdown timed out")
            .expect("Server task panicked")
            .expect("Server returned an error");
    }
}

/// Wait until `condition` holds, polling every 10ms
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(RECV_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}

/// Binary protocol client
pub struct TcpClient {
    stream: TcpStream,
    parser: FrameParser,
    pending: VecDeque<TcpMessage>,
}

impl TcpClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            parser: FrameParser::new(1024 * 1024),
            pending: VecDeque::new(),
        }
    }

    pub async fn send(&mut self, message: &TcpMessage) {
        self.send_raw(&message.encode()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Write failed");
        self.stream.flush().await.expect("Flush failed");
    }

    /// Next message from the server; panics on timeout or close
    pub async fn recv(&mut self) -> TcpMessage {
        timeout(RECV_TIMEOUT, self.next())
            .await
            .expect("Timed out waiting for a message")
            .expect("Connection closed")
    }

    /// Whether the server closes the socket within the receive timeout
    pub async fn closed_by_server(&mut self) -> bool {
        matches!(timeout(RECV_TIMEOUT, self.next()).await, Ok(None))
    }

    /// Assert nothing arrives within `window`
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(message)) = timeout(window, self.next()).await {
            panic!("Unexpected message: {:?}", message);
        }
    }

    /// Authenticate as `user_id` and consume the confirmation
    pub async fn authenticate(&mut self, user_id: i64) {
        self.send(&TcpMessage::Auth(AuthPayload {
            token: token_for(user_id),
        }))
        .await;
        match self.recv().await {
            TcpMessage::AuthSuccess(payload) => assert_eq!(payload.user_id, user_id),
            other => panic!("Expected auth success, got {:?}", other),
        }
    }

    async fn next(&mut self) -> Option<TcpMessage> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            let mut buf = [0u8; 4096];
            let read = self.stream.read(&mut buf).await.ok()?;
            if read == 0 {
                return None;
            }
            for frame in self.parser.feed(&buf[..read]).into_result().ok()? {
                self.pending.push_back(TcpMessage::decode(&frame).ok()?);
            }
        }
    }
}
