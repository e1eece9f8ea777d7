//! Shared chatsync types.
//!
//! - `models`: the client-side domain model (messages, scopes, presence, identity)
//! - `events`: named channel events and their JSON payloads, plus the socket frame envelope
//! - `api`: HTTP response bodies used by the history client

pub mod api;
pub mod events;
pub mod models;

pub use events::{Frame, InboundEvent, OutboundCommand, PayloadError};
pub use models::{Message, MessageId, MessageKind, PresenceEntry, Scope, SessionIdentity};
