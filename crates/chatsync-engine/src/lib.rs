//! Chatsync engine: the client-side half of a live chat.
//!
//! One actor task owns the message log, presence and typing state for the
//! signed-in user and keeps them in step with a [`chatsync_channel::Channel`]:
//! - `store`: ordered log with optimistic sends, reconciliation and read receipts
//! - `presence`: online peers
//! - `typing`: debounced outbound typing and the peers currently typing
//! - `session`: who is signed in
//! - `history`: initial log fetch over HTTP
//!
//! Consumers read `ChatView` snapshots from a watch channel and `EngineNotice`s
//! from a broadcast channel; they act through an `EngineHandle`.

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod presence;
pub mod session;
pub mod store;
pub mod typing;

pub use config::{ConfigError, EngineConfig};
pub use engine::{ChatView, EngineHandle, EngineNotice, spawn};
pub use error::{EngineError, LoadError};
pub use history::{HistorySource, HttpHistory};
pub use session::Session;
