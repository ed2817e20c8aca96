//! Presentation Layer
//!
//! The two client transports (binary TCP and WebSocket), the
//! transport-independent session core they share, and the HTTP glue.

pub mod http;
pub mod realtime;
pub mod tcp;
pub mod websocket;
