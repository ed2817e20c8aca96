//! # Domain Layer
//!
//! Identity types, domain events and the collaborator traits the real-time
//! core consumes. Nothing here depends on a transport or a backend.
//!
//! ## Structure
//!
//! - **user**: public user projection, `AuthVerifier` and `UserLookup`
//! - **events**: lifecycle events and the in-process `EventBus`

pub mod events;
pub mod user;

// Re-export commonly used types
pub use events::{DomainEvent, EventBus, EventKind, MessageEvent};
pub use user::{AuthVerifier, PublicUser, UserLookup, VerifiedIdentity};
