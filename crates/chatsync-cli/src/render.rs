//! Plain-text rendering of engine output.

use chatsync_engine::{ChatView, EngineNotice};
use chatsync_types::Message;

pub fn message(m: &Message) -> String {
    let time = m.created_at.format("%H:%M");
    let mut line = format!("[{}] {}: {}", time, m.sender_name, m.content);
    if m.is_pending() {
        line.push_str(" (sending)");
    } else if m.read_at.is_some() {
        line.push_str(" (read)");
    }
    line
}

pub fn notice(n: &EngineNotice) -> String {
    match n {
        EngineNotice::SendFailed { content, error, .. } => {
            format!("! not sent: \"{}\" ({})", content, error)
        }
        EngineNotice::LoadFailed(e) => format!("! could not load history: {}", e),
        EngineNotice::PayloadDropped(e) => format!("! ignored bad event: {}", e),
        EngineNotice::SessionEnded => "! signed out".to_string(),
    }
}

pub fn who(view: &ChatView) -> String {
    let mut out = format!("{} online", view.display_count());
    for peer in &view.online {
        out.push_str(&format!("\n  {} ({})", peer.display_name, peer.user_id));
    }
    out
}

/// Lines worth printing when the view moves from `prev` to `next`.
pub fn changes(prev: &ChatView, next: &ChatView) -> Vec<String> {
    let mut out = Vec::new();
    if prev.status != next.status {
        out.push(format!("* {}", next.status));
    }
    if prev.scope != next.scope {
        out.push(format!("* now in {}", next.scope));
        out.extend(next.messages.iter().map(message));
        return out;
    }
    // Entries whose rendering changed or that are new.
    for m in next.messages.iter() {
        let before = prev.messages.iter().find(|p| p.id == m.id || same_send(p, m));
        if before.is_none_or(|p| message(p) != message(m)) {
            out.push(message(m));
        }
    }
    if prev.typing != next.typing && !next.typing.is_empty() {
        out.push(format!("* {} typing...", next.typing.join(", ")));
    }
    out
}

/// A confirmed entry that replaced a pending one keeps its place and text.
fn same_send(prev: &Message, next: &Message) -> bool {
    prev.is_pending() && !next.is_pending() && prev.content == next.content && prev.sender_id == next.sender_id
}
