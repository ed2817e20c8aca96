//! Application Startup
//!
//! Wires one broker, one event bus, one connection manager and session
//! handler per transport and one event bridge, then runs the listeners
//! until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::application::EventBridge;
use crate::config::Settings;
use crate::domain::{AuthVerifier, EventBus, UserLookup};
use crate::infrastructure::auth::JwtVerifier;
use crate::infrastructure::pubsub::PubSubBroker;
use crate::infrastructure::users::InMemoryUserDirectory;
use crate::presentation::http::{handlers::health, routes};
use crate::presentation::realtime::{ConnectionLimits, ConnectionManager, Liveness, Transport};
use crate::presentation::tcp::{Tcp, TcpServer, TcpSessionHandler};
use crate::presentation::websocket::{WebSocket, WsSessionHandler};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub broker: Arc<PubSubBroker>,
    pub events: EventBus,
    pub users: InMemoryUserDirectory,
    pub tcp: Arc<TcpSessionHandler>,
    pub websocket: Arc<WsSessionHandler>,
}

impl AppState {
    /// Build both transports around an already connected broker
    pub fn new(settings: Settings, broker: Arc<PubSubBroker>) -> Self {
        let limits = ConnectionLimits::from(&settings.connections);
        let auth: Arc<dyn AuthVerifier> = Arc::new(JwtVerifier::new(&settings.jwt.secret));
        let users = InMemoryUserDirectory::new();
        let lookup: Arc<dyn UserLookup> = Arc::new(users.clone());

        let tcp = Arc::new(TcpSessionHandler::new(
            Arc::new(ConnectionManager::new(Tcp::NAME, limits)),
            Arc::clone(&broker),
            Arc::clone(&auth),
            Arc::clone(&lookup),
        ));
        let websocket = Arc::new(WsSessionHandler::new(
            Arc::new(ConnectionManager::new(WebSocket::NAME, limits)),
            Arc::clone(&broker),
            auth,
            lookup,
        ));

        Self {
            settings: Arc::new(settings),
            broker,
            events: EventBus::default(),
            users,
            tcp,
            websocket,
        }
    }
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
    tcp: TcpServer,
    state: AppState,
    bridge: JoinHandle<()>,
}

impl Application {
    /// Build the application from settings
    pub async fn build(settings: Settings) -> Result<Self> {
        health::init_server_start();

        let broker = Arc::new(PubSubBroker::new(&settings.pubsub));
        broker.connect().await?;
        tracing::info!(backend = broker.backend_name().await, "PubSub broker ready");

        let http_addr = settings.server_addr();
        let tcp_addr = settings.tcp_addr();
        let max_frame_size = settings.tcp.max_frame_size;

        let state = AppState::new(settings, Arc::clone(&broker));

        let bridge = Arc::new(EventBridge::new(broker).with_directory(state.users.clone()))
            .spawn(&state.events);

        let router = routes::create_router(state.clone());

        let listener = TcpListener::bind(&http_addr).await?;
        tracing::info!("HTTP/WebSocket listening on {}", listener.local_addr()?);

        let tcp = TcpServer::bind(&tcp_addr, Arc::clone(&state.tcp), max_frame_size).await?;
        tracing::info!("TCP listening on {}", tcp.local_addr()?);

        Ok(Self {
            listener,
            router,
            tcp,
            state,
            bridge,
        })
    }

    /// Address of the HTTP/WebSocket listener
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address of the binary TCP listener
    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run until Ctrl+C
    pub async fn run_until_stopped(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves, then drain both transports and
    /// disconnect the broker.
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let Self {
            listener,
            router,
            tcp,
            state,
            bridge,
        } = self;
        let settings = Arc::clone(&state.settings);
        let (stop_tx, stop_rx) = watch::channel(false);

        let http = {
            let stopped = wait_for_stop(stop_rx.clone());
            tokio::spawn(async move {
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(stopped)
                .await
            })
        };
        let accept = tokio::spawn(tcp.run(wait_for_stop(stop_rx)));

        let housekeeping = [
            spawn_tcp_sweeper(
                Arc::clone(&state.tcp),
                Duration::from_millis(settings.connections.sweep_interval_ms),
                Duration::from_millis(settings.tcp.idle_timeout_ms),
            ),
            spawn_ping_ticker(
                Arc::clone(&state.websocket),
                Duration::from_millis(settings.websocket.ping_interval_ms),
                settings.websocket.max_missed_pongs,
            ),
        ];

        shutdown.await;
        tracing::info!("Shutdown signal received, draining connections");
        let _ = stop_tx.send(true);
        for task in &housekeeping {
            task.abort();
        }

        let close_timeout = Duration::from_millis(settings.connections.close_timeout_ms);
        tokio::join!(
            state.tcp.manager().close_all(close_timeout),
            state.websocket.manager().close_all(close_timeout),
        );

        if let Err(e) = accept.await {
            tracing::warn!(error = %e, "TCP accept loop failed");
        }
        match http.await {
            Ok(result) => result?,
            Err(e) => tracing::warn!(error = %e, "HTTP server task failed"),
        }

        bridge.abort();
        if let Err(e) = state.broker.disconnect().await {
            tracing::warn!(error = %e, "Failed to disconnect pub/sub backend");
        }
        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    // A dropped sender also means stop
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// Evict TCP connections that have been silent for longer than `idle_timeout`
fn spawn_tcp_sweeper(
    handler: Arc<TcpSessionHandler>,
    every: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = handler
                .manager()
                .remove_stale_connections(Liveness::IdleTimeout(idle_timeout));
            if evicted > 0 {
                tracing::info!(evicted, "Evicted idle TCP connections");
            }
        }
    })
}

/// Evict WebSocket connections that missed too many pongs, then ping the rest
fn spawn_ping_ticker(
    handler: Arc<WsSessionHandler>,
    every: Duration,
    max_missed_pongs: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let manager = handler.manager();
            let evicted = manager.remove_stale_connections(Liveness::MissedPongs(max_missed_pongs));
            if evicted > 0 {
                tracing::info!(evicted, "Evicted unresponsive WebSocket connections");
            }
            let pinged = manager.ping_all();
            tracing::trace!(pinged, "WebSocket ping sent");
        }
    })
}
