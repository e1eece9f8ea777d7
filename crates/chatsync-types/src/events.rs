use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::models::{Message, MessageId, MessageKind, PresenceEntry};

/// Inbound event names delivered by the channel.
pub mod inbound {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const ONLINE_USERS: &str = "onlineUsers";
    pub const USER_ONLINE: &str = "userOnline";
    pub const USER_OFFLINE: &str = "userOffline";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const MESSAGE_SENT: &str = "messageSent";
    pub const MESSAGES_READ: &str = "messagesRead";
    pub const USER_TYPING: &str = "userTyping";
    pub const SYSTEM_MESSAGE: &str = "systemMessage";

    /// Every event the engine subscribes to.
    pub const ALL: &[&str] = &[
        CONNECT,
        DISCONNECT,
        CONNECT_ERROR,
        ONLINE_USERS,
        USER_ONLINE,
        USER_OFFLINE,
        NEW_MESSAGE,
        MESSAGE_SENT,
        MESSAGES_READ,
        USER_TYPING,
        SYSTEM_MESSAGE,
    ];
}

/// Outbound event names emitted to the channel.
pub mod outbound {
    pub const GET_ONLINE_USERS: &str = "getOnlineUsers";
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const MARK_MESSAGES_AS_READ: &str = "markMessagesAsRead";
    pub const TYPING: &str = "typing";
}

/// An inbound payload that could not be turned into an event.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed `{event}` payload: {source}")]
    Shape {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid `{event}` payload: {reason}")]
    Invalid { event: String, reason: &'static str },
}

impl PayloadError {
    pub fn event(&self) -> &str {
        match self {
            Self::Shape { event, .. } | Self::Invalid { event, .. } => event,
        }
    }
}

// -- Payloads --

/// A server-confirmed message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kind: MessageKind,
}

impl MessagePayload {
    /// Validate and convert into a log entry. `event` names the source for errors.
    pub fn into_message(self, event: &str) -> Result<Message, PayloadError> {
        if self.id.trim().is_empty() {
            return Err(PayloadError::Invalid {
                event: event.to_string(),
                reason: "empty message id",
            });
        }
        if self.sender_id.trim().is_empty() {
            return Err(PayloadError::Invalid {
                event: event.to_string(),
                reason: "empty sender id",
            });
        }

        Ok(Message {
            id: MessageId::Confirmed(self.id),
            content: self.content,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            // Servers send `""` or `null` for broadcast messages
            receiver_id: self.receiver_id.filter(|r| !r.is_empty()),
            created_at: self.created_at,
            read_at: self.read_at,
            kind: self.kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default, alias = "connectionId")]
    pub socket_id: String,
}

impl From<OnlineUser> for PresenceEntry {
    fn from(user: OnlineUser) -> Self {
        Self {
            user_id: user.user_id,
            display_name: user.user_name,
            connection_id: user.socket_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesReadPayload {
    pub reader_id: String,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(alias = "active")]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMessagePayload {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl SystemMessagePayload {
    /// System messages are never reconciled, so a missing id gets a local one.
    pub fn into_message(self, received_at: DateTime<Utc>) -> Message {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("system-{}", Uuid::new_v4()));

        Message {
            id: MessageId::Confirmed(id),
            content: self.content,
            sender_id: String::new(),
            sender_name: "system".to_string(),
            receiver_id: None,
            created_at: self.created_at.unwrap_or(received_at),
            read_at: None,
            kind: MessageKind::System,
        }
    }
}

// -- Inbound --

/// A decoded inbound channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// The channel finished its handshake.
    Connected,
    /// The connection dropped or was closed.
    Disconnected { reason: Option<String> },
    /// A connection attempt failed.
    ConnectError { message: String },
    /// Full list of online users.
    OnlineUsers(Vec<OnlineUser>),
    UserOnline(OnlineUser),
    UserOffline(OnlineUser),
    /// A message was posted (possibly the echo of our own send).
    NewMessage(MessagePayload),
    /// Server confirmation of our own send.
    MessageSent(MessagePayload),
    /// A peer read the messages we sent them.
    MessagesRead(MessagesReadPayload),
    UserTyping(TypingPayload),
    SystemMessage(SystemMessagePayload),
}

impl InboundEvent {
    /// Decode a named event. Unknown names yield `Ok(None)`.
    pub fn decode(event: &str, data: &Value) -> Result<Option<Self>, PayloadError> {
        let decoded = match event {
            inbound::CONNECT => Self::Connected,
            inbound::DISCONNECT => Self::Disconnected {
                reason: data.as_str().map(str::to_string),
            },
            inbound::CONNECT_ERROR => Self::ConnectError {
                message: match data {
                    Value::String(s) => s.clone(),
                    Value::Object(map) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| data.to_string()),
                    other => other.to_string(),
                },
            },
            inbound::ONLINE_USERS => Self::OnlineUsers(parse(event, data)?),
            inbound::USER_ONLINE => Self::UserOnline(parse(event, data)?),
            inbound::USER_OFFLINE => Self::UserOffline(parse(event, data)?),
            inbound::NEW_MESSAGE => Self::NewMessage(parse(event, data)?),
            inbound::MESSAGE_SENT => Self::MessageSent(parse(event, data)?),
            inbound::MESSAGES_READ => Self::MessagesRead(parse(event, data)?),
            inbound::USER_TYPING => Self::UserTyping(parse(event, data)?),
            inbound::SYSTEM_MESSAGE => Self::SystemMessage(parse(event, data)?),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}

fn parse<'a, T: Deserialize<'a>>(event: &str, data: &'a Value) -> Result<T, PayloadError> {
    T::deserialize(data).map_err(|source| PayloadError::Shape {
        event: event.to_string(),
        source,
    })
}

// -- Outbound --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub content: String,
    pub receiver_id: Option<String>,
    pub kind: MessageKind,
    /// Client correlation id (the pending id). Servers may ignore it.
    pub client_id: Uuid,
}

/// Commands the client emits to the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    GetOnlineUsers,
    SendMessage(SendMessagePayload),
    MarkMessagesAsRead { sender_id: String },
    Typing { receiver_id: Option<String>, active: bool },
}

impl OutboundCommand {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::GetOnlineUsers => outbound::GET_ONLINE_USERS,
            Self::SendMessage(_) => outbound::SEND_MESSAGE,
            Self::MarkMessagesAsRead { .. } => outbound::MARK_MESSAGES_AS_READ,
            Self::Typing { .. } => outbound::TYPING,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::GetOnlineUsers => Value::Null,
            Self::SendMessage(msg) => json!({
                "content": msg.content,
                "receiverId": msg.receiver_id,
                "kind": msg.kind,
                "clientId": msg.client_id,
            }),
            Self::MarkMessagesAsRead { sender_id } => json!({ "senderId": sender_id }),
            Self::Typing { receiver_id, active } => json!({
                "receiverId": receiver_id,
                "active": active,
            }),
        }
    }
}

// -- Socket framing --

/// Envelope for every WebSocket text frame.
///
/// `Event` flows both ways; a client-sent `Event` carrying `ack` asks the
/// server to answer with an `Ack` frame holding the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Frame {
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },

    Ack {
        id: u64,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
