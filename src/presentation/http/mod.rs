//! HTTP Surface
//!
//! Operational endpoints plus the WebSocket upgrade route.

pub mod handlers;
pub mod routes;
