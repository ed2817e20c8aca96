//! Infrastructure Layer
//!
//! Contains implementations for external services including:
//! - Publish/subscribe delivery backends (in-process, Redis)
//! - JWT token verification
//! - The in-memory user directory
//! - Prometheus metrics

pub mod auth;
pub mod metrics;
pub mod pubsub;
pub mod users;
