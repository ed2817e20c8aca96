//! Health Check Handlers
//!
//! # Endpoints
//! - `GET /health` - Basic health check
//! - `GET /health/live` - Liveness probe (is the process running?)
//! - `GET /health/ready` - Readiness probe (pub/sub backbone and transports)

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::time::Instant;

use crate::infrastructure::pubsub::PubSubStats;
use crate::startup::AppState;

static SERVER_START: Lazy<Instant> = Lazy::new(Instant::now);
static SERVER_START_TIME: Lazy<DateTime<Utc>> = Lazy::new(Utc::now);

/// Pin the start time; call once during startup
pub fn init_server_start() {
    Lazy::force(&SERVER_START);
    Lazy::force(&SERVER_START_TIME);
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness report
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub started_at: String,
    pub pubsub: PubSubHealth,
    pub transports: TransportsHealth,
}

#[derive(Debug, Serialize)]
pub struct PubSubHealth {
    pub status: HealthStatus,
    #[serde(flatten)]
    pub stats: PubSubStats,
}

#[derive(Debug, Serialize)]
pub struct TransportsHealth {
    pub tcp: TransportHealth,
    pub websocket: TransportHealth,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TransportHealth {
    pub connections: usize,
    pub authenticated: usize,
}

/// Overall health status
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Liveness probe, always 200 while the process serves requests
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "alive" })
}

/// Readiness probe
///
/// 200 while the broker can deliver (including after a fallback to the
/// in-process backend, reported as degraded), 503 when it cannot.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.broker.stats().await;
    let status = pubsub_status(&stats);

    let response = ReadinessResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: SERVER_START.elapsed().as_secs(),
        started_at: SERVER_START_TIME.to_rfc3339(),
        pubsub: PubSubHealth { status, stats },
        transports: TransportsHealth {
            tcp: TransportHealth {
                connections: state.tcp.manager().connection_count(),
                authenticated: state.tcp.manager().authenticated_count(),
            },
            websocket: TransportHealth {
                connections: state.websocket.manager().connection_count(),
                authenticated: state.websocket.manager().authenticated_count(),
            },
        },
    };

    let status_code = match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

fn pubsub_status(stats: &PubSubStats) -> HealthStatus {
    if !stats.connected {
        HealthStatus::Unhealthy
    } else if stats.fallback_active {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
