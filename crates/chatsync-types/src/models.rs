use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a message in the local log.
///
/// A message is either confirmed by the server (and carries its id) or still
/// pending, in which case it only has the id the client assigned at send time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "camelCase")]
pub enum MessageId {
    Confirmed(String),
    Pending(Uuid),
}

impl MessageId {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Confirmed(id) => Some(id),
            Self::Pending(_) => None,
        }
    }

    pub fn pending_id(&self) -> Option<Uuid> {
        match self {
            Self::Pending(id) => Some(*id),
            Self::Confirmed(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed(id) => write!(f, "{}", id),
            Self::Pending(id) => write!(f, "pending:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    System,
}

/// Partition of the message log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "peer", rename_all = "camelCase")]
pub enum Scope {
    /// Broadcast messages (no receiver).
    #[default]
    Global,
    /// Conversation between the local user and one peer.
    Direct(String),
}

impl Scope {
    pub fn direct(peer: impl Into<String>) -> Self {
        Self::Direct(peer.into())
    }

    /// Receiver id an outbound event should carry for this scope.
    pub fn receiver_id(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Direct(peer) => Some(peer),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Direct(peer) => write!(f, "direct:{}", peer),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            _ => match s.strip_prefix("direct:") {
                Some(peer) if !peer.is_empty() => Ok(Self::direct(peer)),
                _ => Err(format!("unknown scope '{}'", s)),
            },
        }
    }
}

/// A chat message as held in the client log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub kind: MessageKind,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.id.is_pending()
    }

    /// Scope this message belongs to from the point of view of `local_user`.
    pub fn scope_for(&self, local_user: &str) -> Scope {
        match &self.receiver_id {
            None => Scope::Global,
            Some(receiver) if self.sender_id == local_user => Scope::direct(receiver.clone()),
            Some(_) => Scope::direct(self.sender_id.clone()),
        }
    }

    pub fn in_scope(&self, scope: &Scope, local_user: &str) -> bool {
        match (scope, &self.receiver_id) {
            (Scope::Global, receiver) => receiver.is_none(),
            (Scope::Direct(_), None) => false,
            (Scope::Direct(peer), Some(receiver)) => {
                (self.sender_id == local_user && receiver == peer)
                    || (&self.sender_id == peer && receiver == local_user)
            }
        }
    }
}

/// One online peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub connection_id: String,
}

/// The signed-in user the engine acts as. Supplied by the session boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub user_name: String,
    pub token: String,
}

impl SessionIdentity {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            token: token.into(),
        }
    }
}
