//! Chatsync channel adapter.
//!
//! A `Channel` is one persistent, identity-bound connection to the chat gateway:
//! named events in, named events out, optional acknowledgements on outbound
//! events. Two implementations share the same `Dispatcher` bookkeeping:
//! - `WsChannel`: JSON frames over a WebSocket, with heartbeat and reconnect
//! - `MemoryChannel`: an in-process double driven by a `MemoryServer` handle

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use chatsync_types::SessionIdentity;

pub use connection::{ReconnectConfig, WsChannel, WsConfig};
pub use dispatcher::{Dispatcher, SubscriptionId};
pub use error::ChannelError;
pub use memory::{Emitted, MemoryChannel, MemoryServer};

/// Outcome passed to an acknowledgement callback: the server's payload, or its error text.
pub type AckResult = Result<Value, String>;

/// Called at most once with the server's acknowledgement.
pub type AckCallback = Box<dyn FnOnce(AckResult) + Send>;

/// Invoked once per inbound occurrence of the subscribed event.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error(String),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// A persistent publish/subscribe connection.
///
/// Connection failures never surface as return values from `connect`; they
/// show up on the `status` watch and as a `connect_error` event.
pub trait Channel: Send + Sync {
    /// Open the connection for `identity`. No-op if already connected (or
    /// connecting) as the same identity; replaces the connection otherwise.
    fn connect(&self, identity: &SessionIdentity);

    /// Close the connection. Outstanding ack callbacks are dropped without
    /// being invoked; subscriptions stay registered but receive nothing until
    /// the next connect.
    fn disconnect(&self);

    /// Send an event. `ack`, when given, fires exactly once if the server
    /// answers and never if the connection drops first.
    fn emit(&self, event: &str, payload: Value, ack: Option<AckCallback>) -> Result<(), ChannelError>;

    fn subscribe(&self, event: &str, handler: Handler) -> SubscriptionId;

    /// Idempotent.
    fn unsubscribe(&self, id: SubscriptionId);

    fn status(&self) -> watch::Receiver<ConnectionStatus>;
}
