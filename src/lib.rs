//! # Realtime Server Library
//!
//! A real-time messaging server that accepts clients over two transports,
//! a length-prefixed binary TCP protocol and JSON over WebSocket, and
//! routes messages between them through one publish/subscribe backbone
//! (in-process or Redis, with automatic fallback).
//!
//! ## Module Structure
//!
//! ```text
//! realtime_server/
//! +-- config/          Configuration management
//! +-- domain/          Domain events and collaborator traits
//! +-- application/     Event bridge (domain events -> pub/sub topics)
//! +-- infrastructure/  Pub/sub broker and backends, JWT, metrics
//! +-- presentation/    TCP and WebSocket transports, HTTP glue
//! +-- shared/          Errors and validation
//! ```

// Configuration module
pub mod config;

// Domain layer
pub mod domain;

// Application layer
pub mod application;

// Infrastructure layer - External implementations
pub mod infrastructure;

// Presentation layer - Transports and HTTP handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
