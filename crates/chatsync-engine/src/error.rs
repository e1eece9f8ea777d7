use std::time::Duration;

use chatsync_channel::ChannelError;
use chatsync_types::PayloadError;

/// Why the message history could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("history request was not authorized")]
    Unauthorized,

    #[error("history request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("history request failed: {0}")]
    Request(String),

    #[error("history response could not be decoded: {0}")]
    Decode(String),
}

/// Failures the engine reports through its notices. None of these are fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("no acknowledgement within {0:?}")]
    SendTimeout(Duration),

    #[error("send rejected: {0}")]
    SendRejected(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("dropped malformed `{event}` payload: {reason}")]
    MalformedPayload { event: String, reason: String },
}

impl From<ChannelError> for EngineError {
    fn from(e: ChannelError) -> Self {
        Self::Connection(e.to_string())
    }
}

impl From<PayloadError> for EngineError {
    fn from(e: PayloadError) -> Self {
        Self::MalformedPayload {
            event: e.event().to_string(),
            reason: e.to_string(),
        }
    }
}
