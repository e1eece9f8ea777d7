//! Terminal input: slash commands and plain chat lines.

use chatsync_types::Scope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Plain text to send in the current scope.
    Say(String),
    /// Switch to a conversation.
    Scope(Scope),
    Who,
    Reconnect,
    Help,
    Quit,
    /// Blank line.
    Nothing,
    Unknown(String),
}

pub fn parse(raw: &str) -> Line {
    let line = raw.trim();
    if line.is_empty() {
        return Line::Nothing;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Line::Say(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("dm"), Some(peer)) => Line::Scope(Scope::Direct(peer.to_string())),
        (Some("global"), None) => Line::Scope(Scope::Global),
        (Some("who"), None) => Line::Who,
        (Some("reconnect"), None) => Line::Reconnect,
        (Some("help"), None) => Line::Help,
        (Some("quit" | "exit"), None) => Line::Quit,
        _ => Line::Unknown(line.to_string()),
    }
}

pub const HELP: &str = "\
/dm <user>   talk to one user
/global      back to the global room
/who         list online users
/reconnect   drop and reopen the connection
/quit        leave";
