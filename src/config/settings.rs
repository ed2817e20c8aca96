//! Application settings and configuration structures.

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::infrastructure::pubsub::BackendKind;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// HTTP + WebSocket listener
    pub server: ServerSettings,

    /// Binary TCP protocol listener
    pub tcp: TcpSettings,

    /// WebSocket configuration
    pub websocket: WebSocketSettings,

    /// Connection limits and housekeeping
    pub connections: ConnectionSettings,

    /// Publish/subscribe backend
    pub pubsub: PubSubSettings,

    /// JWT verification settings
    pub jwt: JwtSettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Server binding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,

    /// Port number to listen on
    pub port: u16,
}

/// TCP transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpSettings {
    pub host: String,

    pub port: u16,

    /// Largest accepted frame payload in bytes (default: 1MB).
    /// Larger declared lengths close the connection.
    pub max_frame_size: usize,

    /// Connections silent for longer than this are evicted (default: 120s)
    pub idle_timeout_ms: u64,
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSettings {
    /// Maximum message size in bytes (default: 64KB)
    /// Protects against DoS via oversized messages
    pub max_message_size: usize,

    /// Maximum frame size in bytes (default: 16KB)
    pub max_frame_size: usize,

    /// Interval between server pings in milliseconds (default: 30000)
    pub ping_interval_ms: u64,

    /// Consecutive unanswered pings before eviction (default: 2)
    pub max_missed_pongs: u32,
}

/// Connection limits, shared by both transports.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    /// Maximum simultaneous connections from one IP address
    pub max_per_ip: usize,

    /// Global connection cap per transport (0 = unlimited)
    pub max_connections: usize,

    /// Interval of the stale connection sweep in milliseconds
    pub sweep_interval_ms: u64,

    /// Per-connection graceful close timeout on shutdown
    pub close_timeout_ms: u64,
}

/// Publish/subscribe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PubSubSettings {
    /// `memory` or `redis`
    pub backend: BackendKind,

    /// Redis connection URL (only used by the redis backend)
    pub redis_url: String,

    /// Prefix of every Redis channel name
    pub channel_prefix: String,

    /// Give up on the distributed backend after this long
    pub connect_timeout_ms: u64,
}

/// JWT verification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    /// Secret key used to verify tokens
    pub secret: String,
}

/// Minimum required length for JWT secret (256 bits = 32 bytes)
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. config/default.toml (base configuration)
    /// 2. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 3. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed,
    /// or if JWT secret is too short.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Determine the running environment
        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        Self::defaults(Config::builder(), &environment)?
            // Load from config files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Load from environment variables
            // APP__TCP__PORT=4000 -> tcp.port = 4000
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            // Map simple environment variables
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("tcp.port", std::env::var("TCP_PORT").ok())?
            .set_override_option("pubsub.redis_url", std::env::var("REDIS_URL").ok())?
            .set_override_option("pubsub.backend", std::env::var("PUBSUB_BACKEND").ok())?
            .set_override_option("jwt.secret", std::env::var("JWT_SECRET").ok())?
            .build()?
            .try_deserialize()
            .and_then(Self::validate)
    }

    /// Built-in defaults, applied before any file or environment source.
    pub fn defaults(
        builder: ConfigBuilder<DefaultState>,
        environment: &str,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        builder
            .set_default("environment", environment)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("tcp.host", "0.0.0.0")?
            .set_default("tcp.port", 4000)?
            .set_default("tcp.max_frame_size", 1_048_576_i64)? // 1MB
            .set_default("tcp.idle_timeout_ms", 120_000_i64)?
            // WebSocket settings - security limits to prevent DoS
            .set_default("websocket.max_message_size", 65536_i64)? // 64KB
            .set_default("websocket.max_frame_size", 16384_i64)? // 16KB
            .set_default("websocket.ping_interval_ms", 30_000_i64)?
            .set_default("websocket.max_missed_pongs", 2_i64)?
            .set_default("connections.max_per_ip", 10_i64)?
            .set_default("connections.max_connections", 0_i64)?
            .set_default("connections.sweep_interval_ms", 30_000_i64)?
            .set_default("connections.close_timeout_ms", 5_000_i64)?
            .set_default("pubsub.backend", "memory")?
            .set_default("pubsub.redis_url", "redis://127.0.0.1:6379")?
            .set_default("pubsub.channel_prefix", "pubsub:")?
            .set_default("pubsub.connect_timeout_ms", 3_000_i64)
    }

    fn validate(settings: Self) -> Result<Self, ConfigError> {
        // Validate JWT secret length for security
        if settings.jwt.secret.len() < MIN_JWT_SECRET_LENGTH {
            return Err(ConfigError::Message(format!(
                "JWT secret must be at least {} characters for security. Current length: {}",
                MIN_JWT_SECRET_LENGTH,
                settings.jwt.secret.len()
            )));
        }
        if settings.connections.max_per_ip == 0 {
            return Err(ConfigError::Message(
                "connections.max_per_ip must be at least 1".into(),
            ));
        }
        if settings.connections.sweep_interval_ms == 0 || settings.websocket.ping_interval_ms == 0 {
            return Err(ConfigError::Message(
                "sweep and ping intervals must be greater than zero".into(),
            ));
        }
        Ok(settings)
    }

    /// Get the full HTTP server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get the full TCP listener address as a string.
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.tcp.host, self.tcp.port)
    }
}
