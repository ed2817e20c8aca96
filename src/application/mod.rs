//! Application Layer
//!
//! Glue between business events and the real-time core.

pub mod event_bridge;

pub use event_bridge::EventBridge;
