use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use chatsync_types::{Message, MessageId, MessageKind, Scope};

/// What happened to a confirmed message handed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Took the place of this pending entry.
    Replaced(Uuid),
    /// No pending twin, added at the end.
    Appended,
    /// Already in the log under the same server id.
    Duplicate,
    /// No pending twin and the caller asked for replace-only.
    Unmatched,
}

/// The ordered message log for one session, including optimistic sends.
///
/// Pending entries are matched to confirmations by sender, content and
/// scope, oldest first, and a confirmation lands exactly where its
/// placeholder was. Two identical sends in flight therefore resolve in
/// arrival order rather than by correlation id.
#[derive(Debug, Clone)]
pub struct MessageStore {
    local_user: String,
    send_timeout: Duration,
    log: Vec<Message>,
    /// pending id -> expiry
    deadlines: HashMap<Uuid, Instant>,
    /// Bumped whenever `log` changes.
    revision: u64,
}

impl MessageStore {
    pub fn new(local_user: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            local_user: local_user.into(),
            send_timeout,
            log: Vec::new(),
            deadlines: HashMap::new(),
            revision: 0,
        }
    }

    /// Replace the log with server history. Outstanding pending entries are
    /// kept after it with their timers intact.
    pub fn load(&mut self, history: Vec<Message>) {
        let pending: Vec<Message> = self.log.drain(..).filter(Message::is_pending).collect();
        self.revision += 1;

        for message in history {
            if message.is_pending() || self.contains_server_id(&message.id) {
                continue;
            }
            self.log.push(message);
        }
        self.log.extend(pending);
    }

    /// Append an optimistic entry for a local send and return its pending id.
    /// The caller emits it.
    pub fn push_pending(
        &mut self,
        content: impl Into<String>,
        scope: &Scope,
        sender_name: impl Into<String>,
        now: Instant,
    ) -> Uuid {
        let pending_id = Uuid::new_v4();
        let message = Message {
            id: MessageId::Pending(pending_id),
            content: content.into(),
            sender_id: self.local_user.clone(),
            sender_name: sender_name.into(),
            receiver_id: scope.receiver_id().map(str::to_string),
            created_at: Utc::now(),
            read_at: None,
            kind: MessageKind::Text,
        };
        self.deadlines.insert(pending_id, now + self.send_timeout);
        self.log.push(message);
        self.revision += 1;
        pending_id
    }

    /// Fold a confirmed message into the log, replacing its pending twin if any.
    pub fn reconcile(&mut self, message: Message) -> Reconciled {
        self.fold(message, true)
    }

    /// The server accepted this send: stop its timer. The entry stays
    /// pending until the confirmed message replaces it.
    pub fn acknowledge(&mut self, pending_id: Uuid) -> bool {
        self.deadlines.remove(&pending_id).is_some()
    }

    /// Fold the message an ack carried for `pending_id`. It replaces that
    /// exact entry when still present, otherwise reconciles as usual.
    pub fn settle(&mut self, pending_id: Uuid, message: Message) -> Reconciled {
        if message.is_pending() || self.contains_server_id(&message.id) {
            return Reconciled::Duplicate;
        }
        match self.position_of(pending_id) {
            Some(index) => {
                self.log[index] = message;
                self.deadlines.remove(&pending_id);
                self.revision += 1;
                Reconciled::Replaced(pending_id)
            }
            None => self.fold(message, true),
        }
    }

    /// Like [`Self::reconcile`] but never appends: a confirmation of our own
    /// send with no placeholder left (it expired) is dropped.
    pub fn confirm(&mut self, message: Message) -> Reconciled {
        self.fold(message, false)
    }

    fn fold(&mut self, message: Message, append_unmatched: bool) -> Reconciled {
        if message.is_pending() || self.contains_server_id(&message.id) {
            return Reconciled::Duplicate;
        }

        let twin = self.log.iter().position(|m| {
            m.is_pending()
                && m.sender_id == message.sender_id
                && m.content == message.content
                && m.receiver_id == message.receiver_id
        });

        match twin {
            Some(index) => {
                let replaced = std::mem::replace(&mut self.log[index], message);
                let pending_id = replaced.id.pending_id().unwrap_or_default();
                self.deadlines.remove(&pending_id);
                self.revision += 1;
                Reconciled::Replaced(pending_id)
            }
            None if append_unmatched => {
                self.log.push(message);
                self.revision += 1;
                Reconciled::Appended
            }
            None => Reconciled::Unmatched,
        }
    }

    /// Append a message that never takes part in reconciliation.
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains_server_id(&message.id) {
            return false;
        }
        self.log.push(message);
        self.revision += 1;
        true
    }

    /// Remove a pending entry (the server rejected it).
    pub fn discard(&mut self, pending_id: Uuid) -> Option<Message> {
        self.deadlines.remove(&pending_id);
        let index = self.position_of(pending_id)?;
        self.revision += 1;
        Some(self.log.remove(index))
    }

    /// Remove and return pending entries whose window has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Message> {
        let expired: Vec<Uuid> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }

        for id in &expired {
            self.deadlines.remove(id);
        }
        let mut removed = Vec::with_capacity(expired.len());
        self.log.retain(|m| match m.id.pending_id() {
            Some(id) if expired.contains(&id) => {
                removed.push(m.clone());
                false
            }
            _ => true,
        });
        if !removed.is_empty() {
            self.revision += 1;
        }
        removed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// A peer read our messages: stamp every unread one we sent them.
    /// Existing `read_at` values are never touched.
    pub fn mark_read_by(&mut self, reader_id: &str, read_at: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for message in &mut self.log {
            if message.sender_id == self.local_user
                && message.receiver_id.as_deref() == Some(reader_id)
                && !message.is_pending()
                && message.read_at.is_none()
            {
                message.read_at = Some(read_at);
                marked += 1;
            }
        }
        if marked > 0 {
            self.revision += 1;
        }
        marked
    }

    /// Whether receiving `message` live should trigger `markMessagesAsRead`.
    pub fn needs_read_receipt(&self, message: &Message) -> bool {
        message.receiver_id.as_deref() == Some(self.local_user.as_str())
            && message.sender_id != self.local_user
            && message.read_at.is_none()
    }

    /// Messages in `scope`, in log order.
    pub fn visible(&self, scope: &Scope) -> Vec<Message> {
        self.log
            .iter()
            .filter(|m| m.in_scope(scope, &self.local_user))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[Message] {
        &self.log
    }

    /// Changes whenever the log does; cheap to compare.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending_count(&self) -> usize {
        self.log.iter().filter(|m| m.is_pending()).count()
    }

    fn position_of(&self, pending_id: Uuid) -> Option<usize> {
        self.log.iter().position(|m| m.id.pending_id() == Some(pending_id))
    }

    fn contains_server_id(&self, id: &MessageId) -> bool {
        match id.server_id() {
            Some(server_id) => self.log.iter().any(|m| m.id.server_id() == Some(server_id)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn confirmed(id: &str, sender: &str, content: &str, receiver: Option<&str>) -> Message {
        Message {
            id: MessageId::Confirmed(id.to_string()),
            content: content.to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_uppercase(),
            receiver_id: receiver.map(str::to_string),
            created_at: Utc::now(),
            read_at: None,
            kind: MessageKind::Text,
        }
    }

    fn ids(store: &MessageStore) -> Vec<String> {
        store.all().iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn echo_replaces_pending_in_place() {
        let mut store = MessageStore::new("me", TIMEOUT);
        let now = Instant::now();
        store.append(confirmed("1", "bob", "yo", None));
        let pending = store.push_pending("hi", &Scope::Global, "Me", now);
        store.append(confirmed("2", "bob", "still there?", None));

        let outcome = store.reconcile(confirmed("3", "me", "hi", None));

        assert_eq!(outcome, Reconciled::Replaced(pending));
        assert_eq!(ids(&store), vec!["1", "3", "2"]);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.next_deadline(), None);
    }

    #[test]
    fn echo_and_ack_for_same_id_leave_one_entry() {
        let mut store = MessageStore::new("me", TIMEOUT);
        store.push_pending("hi", &Scope::Global, "Me", Instant::now());

        store.reconcile(confirmed("9", "me", "hi", None));
        assert_eq!(store.confirm(confirmed("9", "me", "hi", None)), Reconciled::Duplicate);
        assert_eq!(store.reconcile(confirmed("9", "me", "hi", None)), Reconciled::Duplicate);
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn identical_sends_resolve_oldest_first() {
        let mut store = MessageStore::new("me", TIMEOUT);
        let now = Instant::now();
        let first = store.push_pending("ok", &Scope::Global, "Me", now);
        let second = store.push_pending("ok", &Scope::Global, "Me", now);

        assert_eq!(
            store.reconcile(confirmed("a", "me", "ok", None)),
            Reconciled::Replaced(first)
        );
        assert_eq!(store.all()[1].id, MessageId::Pending(second));
        assert_eq!(
            store.reconcile(confirmed("b", "me", "ok", None)),
            Reconciled::Replaced(second)
        );
        assert_eq!(ids(&store), vec!["a", "b"]);
    }

    #[test]
    fn scope_is_part_of_the_match() {
        let mut store = MessageStore::new("me", TIMEOUT);
        store.push_pending("hi", &Scope::direct("bob"), "Me", Instant::now());

        assert_eq!(store.reconcile(confirmed("1", "me", "hi", None)), Reconciled::Appended);
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.confirm(confirmed("2", "me", "hi", Some("carol"))), Reconciled::Unmatched);
        assert!(matches!(
            store.reconcile(confirmed("3", "me", "hi", Some("bob"))),
            Reconciled::Replaced(_)
        ));
    }

    #[test]
    fn timeout_removes_pending_and_late_echo_appends() {
        let mut store = MessageStore::new("me", TIMEOUT);
        let now = Instant::now();
        store.push_pending("hi", &Scope::Global, "Me", now);
        assert_eq!(store.next_deadline(), Some(now + TIMEOUT));

        assert!(store.expire(now + TIMEOUT - Duration::from_millis(1)).is_empty());
        let expired = store.expire(now + TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert!(store.all().is_empty());

        assert_eq!(store.reconcile(confirmed("7", "me", "hi", None)), Reconciled::Appended);
        assert_eq!(ids(&store), vec!["7"]);
    }

    #[test]
    fn acknowledged_send_outlives_its_timer() {
        let mut store = MessageStore::new("me", TIMEOUT);
        let now = Instant::now();
        let pending = store.push_pending("hi", &Scope::Global, "Me", now);

        assert!(store.acknowledge(pending));
        assert!(!store.acknowledge(pending));
        assert_eq!(store.next_deadline(), None);
        assert!(store.expire(now + TIMEOUT * 2).is_empty());
        assert_eq!(store.pending_count(), 1);

        assert_eq!(store.reconcile(confirmed("9", "me", "hi", None)), Reconciled::Replaced(pending));
        assert_eq!(ids(&store), vec!["9"]);
    }

    #[test]
    fn ack_payload_replaces_its_own_entry() {
        let mut store = MessageStore::new("me", TIMEOUT);
        let now = Instant::now();
        let first = store.push_pending("hi", &Scope::Global, "Me", now);
        let second = store.push_pending("hi", &Scope::Global, "Me", now);

        // The server trimmed the text; the tuple would not match
        assert_eq!(
            store.settle(second, confirmed("b", "me", "hi!", None)),
            Reconciled::Replaced(second)
        );
        assert_eq!(store.all()[0].id, MessageId::Pending(first));
        assert_eq!(store.all()[1].id, MessageId::Confirmed("b".into()));
        assert_eq!(store.next_deadline(), Some(now + TIMEOUT));

        assert_eq!(store.settle(second, confirmed("b", "me", "hi!", None)), Reconciled::Duplicate);
        // Entry already gone: fall back to tuple matching
        assert_eq!(
            store.settle(second, confirmed("a", "me", "hi", None)),
            Reconciled::Replaced(first)
        );
        assert_eq!(ids(&store), vec!["a", "b"]);
    }

    #[test]
    fn revision_tracks_log_changes_only() {
        let mut store = MessageStore::new("me", TIMEOUT);
        let now = Instant::now();
        let start = store.revision();

        let pending = store.push_pending("hi", &Scope::Global, "Me", now);
        let after_send = store.revision();
        assert_ne!(after_send, start);

        store.acknowledge(pending);
        assert!(store.expire(now + TIMEOUT).is_empty());
        assert_eq!(store.mark_read_by("bob", Utc::now()), 0);
        assert_eq!(store.revision(), after_send);

        assert!(store.append(confirmed("x", "bob", "a", None)));
        let before = store.revision();
        assert_ne!(before, after_send);
        assert!(!store.append(confirmed("x", "bob", "a", None)));
        assert_eq!(store.reconcile(confirmed("x", "bob", "a", None)), Reconciled::Duplicate);
        assert_eq!(store.revision(), before);
    }

    #[test]
    fn discard_removes_exact_entry() {
        let mut store = MessageStore::new("me", TIMEOUT);
        let now = Instant::now();
        let first = store.push_pending("dup", &Scope::Global, "Me", now);
        let second = store.push_pending("dup", &Scope::Global, "Me", now);

        let removed = store.discard(second).unwrap();
        assert_eq!(removed.id, MessageId::Pending(second));
        assert_eq!(store.all()[0].id, MessageId::Pending(first));
        assert!(store.discard(second).is_none());
    }

    #[test]
    fn load_keeps_pending_after_history() {
        let mut store = MessageStore::new("me", TIMEOUT);
        store.append(confirmed("old", "bob", "stale", None));
        let pending = store.push_pending("hi", &Scope::Global, "Me", Instant::now());

        store.load(vec![
            confirmed("1", "bob", "a", None),
            confirmed("2", "me", "b", None),
            confirmed("1", "bob", "a", None),
        ]);

        assert_eq!(
            ids(&store),
            vec!["1".to_string(), "2".to_string(), MessageId::Pending(pending).to_string()]
        );
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn read_at_is_monotonic() {
        let mut store = MessageStore::new("me", TIMEOUT);
        store.append(confirmed("1", "me", "one", Some("bob")));
        store.append(confirmed("2", "me", "two", Some("carol")));
        store.append(confirmed("3", "bob", "three", Some("me")));

        let first = Utc::now();
        assert_eq!(store.mark_read_by("bob", first), 1);
        store.append(confirmed("4", "me", "four", Some("bob")));

        let later = first + chrono::Duration::seconds(30);
        assert_eq!(store.mark_read_by("bob", later), 1);

        let read: Vec<Option<DateTime<Utc>>> = store.all().iter().map(|m| m.read_at).collect();
        assert_eq!(read, vec![Some(first), None, None, Some(later)]);
    }

    #[test]
    fn read_receipt_only_for_direct_messages_to_us() {
        let store = MessageStore::new("me", TIMEOUT);
        assert!(store.needs_read_receipt(&confirmed("1", "bob", "hey", Some("me"))));
        assert!(!store.needs_read_receipt(&confirmed("2", "bob", "hey", None)));
        assert!(!store.needs_read_receipt(&confirmed("3", "me", "hey", Some("bob"))));

        let mut read = confirmed("4", "bob", "hey", Some("me"));
        read.read_at = Some(Utc::now());
        assert!(!store.needs_read_receipt(&read));
    }

    #[test]
    fn visible_filters_by_scope_in_order() {
        let mut store = MessageStore::new("me", TIMEOUT);
        store.append(confirmed("1", "bob", "g1", None));
        store.append(confirmed("2", "bob", "d1", Some("me")));
        store.append(confirmed("3", "me", "d2", Some("bob")));
        store.append(confirmed("4", "carol", "d3", Some("me")));
        store.append(confirmed("5", "me", "g2", None));

        let direct: Vec<String> = store
            .visible(&Scope::direct("bob"))
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(direct, vec!["d1", "d2"]);
        assert_eq!(store.visible(&Scope::Global).len(), 2);
    }
}
