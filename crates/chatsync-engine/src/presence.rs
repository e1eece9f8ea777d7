use chatsync_types::PresenceEntry;

/// Online peers for the current connection, in arrival order.
///
/// The local user is never listed. Every mutator reports whether the set changed.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_user: String,
    peers: Vec<PresenceEntry>,
}

impl PresenceTracker {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            peers: Vec::new(),
        }
    }

    /// Replace the whole set. Returns the ids of peers that are no longer online.
    pub fn on_snapshot(&mut self, entries: impl IntoIterator<Item = PresenceEntry>) -> Vec<String> {
        let mut next: Vec<PresenceEntry> = Vec::new();
        for entry in entries {
            if entry.user_id == self.local_user || next.iter().any(|p| p.user_id == entry.user_id) {
                continue;
            }
            next.push(entry);
        }

        let departed = self
            .peers
            .iter()
            .filter(|old| !next.iter().any(|p| p.user_id == old.user_id))
            .map(|old| old.user_id.clone())
            .collect();
        self.peers = next;
        departed
    }

    /// Duplicate joins are ignored.
    pub fn on_join(&mut self, entry: PresenceEntry) -> bool {
        if entry.user_id == self.local_user || self.contains(&entry.user_id) {
            return false;
        }
        self.peers.push(entry);
        true
    }

    /// Idempotent.
    pub fn on_leave(&mut self, user_id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.user_id != user_id);
        self.peers.len() != before
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.peers.is_empty();
        self.peers.clear();
        changed
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.peers.iter().any(|p| p.user_id == user_id)
    }

    pub fn peers(&self) -> &[PresenceEntry] {
        &self.peers
    }

    /// Number of online peers, excluding the local user.
    pub fn online_count(&self) -> usize {
        self.peers.len()
    }

    /// Count as shown to the user, who is online too.
    pub fn display_count(&self) -> usize {
        self.peers.len() + 1
    }
}
