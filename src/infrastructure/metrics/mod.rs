//! Prometheus Metrics Module
//!
//! Provides application-wide metrics collection using Prometheus.
//!
//! # Metrics Collected
//! - Active connections per transport and state
//! - Rejected connections per transport and reason
//! - Published messages per backend, delivery outcomes
//! - TCP frame errors and protocol messages per type
//!
//! Every helper is fire-and-forget; nothing here sits on the delivery path.

use once_cell::sync::Lazy;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Active connections gauge
pub static CONNECTIONS_ACTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("connections_active", "Number of live connections").namespace("realtime"),
        &["transport", "state"], // state: "connected", "authenticated"
    )
    .expect("Failed to create CONNECTIONS_ACTIVE metric")
});

/// Connections refused by limits
pub static CONNECTIONS_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "connections_rejected_total",
            "Connections refused because a limit was reached",
        )
        .namespace("realtime"),
        &["transport", "reason"],
    )
    .expect("Failed to create CONNECTIONS_REJECTED_TOTAL metric")
});

/// Messages published through the broker
pub static PUBSUB_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pubsub_published_total", "Messages published").namespace("realtime"),
        &["backend"],
    )
    .expect("Failed to create PUBSUB_PUBLISHED_TOTAL metric")
});

/// Per-subscription delivery outcomes
pub static PUBSUB_DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pubsub_deliveries_total", "Subscription deliveries").namespace("realtime"),
        &["outcome"], // "delivered", "failed"
    )
    .expect("Failed to create PUBSUB_DELIVERIES_TOTAL metric")
});

/// TCP framing and decoding errors
pub static FRAME_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("frame_errors_total", "TCP frame and decode errors").namespace("realtime"),
        &["kind"],
    )
    .expect("Failed to create FRAME_ERRORS_TOTAL metric")
});

/// Client protocol messages handled
pub static PROTOCOL_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("protocol_messages_total", "Client protocol messages handled")
            .namespace("realtime"),
        &["transport", "type"],
    )
    .expect("Failed to create PROTOCOL_MESSAGES_TOTAL metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(CONNECTIONS_REJECTED_TOTAL.clone()))
        .expect("Failed to register CONNECTIONS_REJECTED_TOTAL");
    registry
        .register(Box::new(PUBSUB_PUBLISHED_TOTAL.clone()))
        .expect("Failed to register PUBSUB_PUBLISHED_TOTAL");
    registry
        .register(Box::new(PUBSUB_DELIVERIES_TOTAL.clone()))
        .expect("Failed to register PUBSUB_DELIVERIES_TOTAL");
    registry
        .register(Box::new(FRAME_ERRORS_TOTAL.clone()))
        .expect("Failed to register FRAME_ERRORS_TOTAL");
    registry
        .register(Box::new(PROTOCOL_MESSAGES_TOTAL.clone()))
        .expect("Failed to register PROTOCOL_MESSAGES_TOTAL");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper to update connection gauges for one transport
pub fn set_connections(transport: &str, connected: usize, authenticated: usize) {
    CONNECTIONS_ACTIVE
        .with_label_values(&[transport, "connected"])
        .set(connected as f64);
    CONNECTIONS_ACTIVE
        .with_label_values(&[transport, "authenticated"])
        .set(authenticated as f64);
}

/// Helper to count a refused connection
pub fn record_rejected_connection(transport: &str, reason: &str) {
    CONNECTIONS_REJECTED_TOTAL
        .with_label_values(&[transport, reason])
        .inc();
}

/// Helper to count a publish
pub fn record_publish(backend: &str) {
    PUBSUB_PUBLISHED_TOTAL.with_label_values(&[backend]).inc();
}

/// Helper to count one delivery attempt
pub fn record_delivery(delivered: bool) {
    let outcome = if delivered { "delivered" } else { "failed" };
    PUBSUB_DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Helper to count a TCP framing or decoding error
pub fn record_frame_error(kind: &str) {
    FRAME_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Helper to count a handled client message
pub fn record_protocol_message(transport: &str, kind: &str) {
    PROTOCOL_MESSAGES_TOTAL
        .with_label_values(&[transport, kind])
        .inc();
}
