//! End-to-end engine behaviour over an in-memory channel.
//!
//! Time is paused: the runtime jumps the clock forward whenever every task is
//! idle, so send timeouts and typing deadlines fire without real waiting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use chatsync_channel::{MemoryChannel, MemoryServer};
use chatsync_engine::{
    ChatView, EngineConfig, EngineError, EngineHandle, EngineNotice, HistorySource, LoadError,
    Session,
};
use chatsync_types::{Message, MessageId, MessageKind, Scope, SessionIdentity};

const WAIT: Duration = Duration::from_secs(30);

// -- Fixtures --

type Reply = (Duration, Result<Vec<Message>, LoadError>);

/// History source answering from a queue; empty history once the queue runs dry.
#[derive(Default)]
struct StubHistory {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
}

impl StubHistory {
    fn reply(&self, delay: Duration, result: Result<Vec<Message>, LoadError>) {
        self.replies.lock().push_back((delay, result));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HistorySource for StubHistory {
    fn fetch(&self, _identity: &SessionIdentity) -> BoxFuture<'static, Result<Vec<Message>, LoadError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (delay, result) = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or((Duration::ZERO, Ok(Vec::new())));
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

struct Harness {
    engine: EngineHandle,
    server: MemoryServer,
    session: Session,
    history: Arc<StubHistory>,
    view: watch::Receiver<ChatView>,
    notices: broadcast::Receiver<EngineNotice>,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("chatsync=trace")
            .with_test_writer()
            .try_init();

        let (channel, server) = MemoryChannel::new();
        let history = Arc::new(StubHistory::default());
        let session = Session::new();
        let engine = chatsync_engine::spawn(
            EngineConfig::default(),
            Arc::new(channel),
            history.clone(),
            session.subscribe(),
        );
        Self {
            view: engine.view(),
            notices: engine.notices(),
            engine,
            server,
            session,
            history,
        }
    }

    /// Sign in as alice and let the initial load finish.
    async fn online() -> Self {
        let harness = Self::new();
        harness.session.login(alice());
        settle().await;
        harness
    }

    async fn until(&mut self, what: &str, cond: impl FnMut(&ChatView) -> bool) -> ChatView {
        let view = timeout(WAIT, self.view.wait_for(cond))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .expect("engine stopped");
        ChatView::clone(&view)
    }

    async fn notice(&mut self) -> EngineNotice {
        timeout(WAIT, self.notices.recv())
            .await
            .expect("timed out waiting for a notice")
            .expect("notice channel closed")
    }

    /// Ack id of the most recent `sendMessage`.
    fn last_send_ack(&self) -> u64 {
        self.server
            .emitted()
            .into_iter()
            .rev()
            .find(|e| e.event == "sendMessage")
            .and_then(|e| e.ack)
            .expect("no acked sendMessage emitted")
    }

    /// Emitted events other than the presence request, as (name, payload).
    fn traffic(&self) -> Vec<(String, Value)> {
        self.server
            .emitted()
            .into_iter()
            .filter(|e| e.event != "getOnlineUsers")
            .map(|e| (e.event, e.payload))
            .collect()
    }
}

/// Let every runnable task drain its queue.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn alice() -> SessionIdentity {
    SessionIdentity::new("alice", "Alice", "token-a")
}

fn wire(id: &str, sender: &str, content: &str, receiver: Option<&str>) -> Value {
    json!({
        "id": id,
        "content": content,
        "senderId": sender,
        "senderName": sender.to_uppercase(),
        "receiverId": receiver,
        "createdAt": "2024-05-01T10:00:00Z",
    })
}

fn stored(id: &str, sender: &str, content: &str, receiver: Option<&str>) -> Message {
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

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.to_string()).collect()
}

// -- Connect & history --

#[tokio::test(start_paused = true)]
async fn connect_loads_history_and_requests_presence() {
    let mut h = Harness::new();
    h.history.reply(
        Duration::ZERO,
        Ok(vec![
            stored("1", "bob", "hello", None),
            stored("2", "alice", "hi bob", Some("bob")),
        ]),
    );

    h.session.login(alice());
    let view = h.until("history", |v| v.messages_all.len() == 2).await;

    assert!(view.status.is_connected());
    assert_eq!(view.user_id.as_deref(), Some("alice"));
    assert_eq!(ids(&view.messages), vec!["1"]);
    assert_eq!(h.server.identity(), Some(alice()));
    assert_eq!(h.server.emitted_named("getOnlineUsers").len(), 1);

    h.server.push(
        "onlineUsers",
        json!([
            { "userId": "alice", "userName": "Alice", "socketId": "s1" },
            { "userId": "bob", "userName": "Bob", "socketId": "s2" },
        ]),
    );
    let view = h.until("presence", |v| !v.online.is_empty()).await;
    assert_eq!(view.online.len(), 1);
    assert_eq!(view.online[0].display_name, "Bob");
    assert_eq!(view.display_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn history_failure_leaves_empty_log() {
    let mut h = Harness::new();
    h.history.reply(Duration::ZERO, Err(LoadError::Unauthorized));

    h.session.login(alice());

    assert_eq!(h.notice().await, EngineNotice::LoadFailed(LoadError::Unauthorized));
    let view = h.until("load error", |v| v.load_error.is_some()).await;
    assert_eq!(view.load_error, Some(LoadError::Unauthorized));
    assert!(view.messages_all.is_empty());
    assert_eq!(h.history.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn history_after_logout_is_discarded() {
    let mut h = Harness::new();
    h.history.reply(
        Duration::from_secs(2),
        Ok(vec![stored("1", "bob", "too late", None)]),
    );

    h.session.login(alice());
    settle().await;
    h.session.logout();

    assert_eq!(h.notice().await, EngineNotice::SessionEnded);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let view = h.engine.snapshot();
    assert!(view.messages_all.is_empty());
    assert_eq!(view.user_id, None);
    assert_eq!(h.server.identity(), None);
}

#[tokio::test(start_paused = true)]
async fn superseded_load_is_discarded() {
    let mut h = Harness::new();
    h.history.reply(Duration::from_secs(2), Ok(vec![stored("old", "bob", "stale", None)]));
    h.history.reply(Duration::ZERO, Ok(vec![stored("new", "bob", "fresh", None)]));

    h.session.login(alice());
    settle().await;
    h.engine.reconnect();

    h.until("fresh history", |v| !v.messages_all.is_empty()).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(ids(&h.engine.snapshot().messages_all), vec!["new"]);
    assert_eq!(h.history.calls(), 2);
}

// -- Optimistic sends --

#[tokio::test(start_paused = true)]
async fn echo_confirms_pending_in_place() {
    let mut h = Harness::online().await;

    h.engine.send_message("hi", Scope::Global);
    let view = h.until("pending entry", |v| v.messages.len() == 1).await;
    let pending = &view.messages[0];
    assert!(pending.is_pending());
    assert_eq!(pending.sender_name, "Alice");

    let sent = h.server.emitted_named("sendMessage");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["content"], "hi");
    assert_eq!(sent[0]["receiverId"], Value::Null);
    assert_eq!(sent[0]["kind"], "text");
    assert_eq!(
        sent[0]["clientId"].as_str().map(str::to_string),
        pending.id.pending_id().map(|id| id.to_string())
    );

    h.server.push("newMessage", wire("m1", "alice", "hi", None));
    let view = h
        .until("confirmation", |v| v.messages.iter().all(|m| !m.is_pending()))
        .await;
    assert_eq!(ids(&view.messages), vec!["m1"]);

    // The ack for the same send arrives after the echo
    assert!(h.server.ack(h.last_send_ack(), Ok(wire("m1", "alice", "hi", None))));
    settle().await;
    assert_eq!(ids(&h.engine.snapshot().messages_all), vec!["m1"]);
}

#[tokio::test(start_paused = true)]
async fn ack_then_echo_leaves_one_entry() {
    let mut h = Harness::online().await;
    h.server.push("newMessage", wire("m0", "bob", "before", None));

    h.engine.send_message("hi", Scope::Global);
    h.until("pending entry", |v| v.messages.len() == 2).await;

    assert!(h.server.ack(h.last_send_ack(), Ok(wire("m1", "alice", "hi", None))));
    h.until("ack", |v| v.messages.iter().all(|m| !m.is_pending())).await;

    h.server.push("newMessage", wire("m1", "alice", "hi", None));
    h.server.push("messageSent", wire("m1", "alice", "hi", None));
    settle().await;

    assert_eq!(ids(&h.engine.snapshot().messages_all), vec!["m0", "m1"]);
}

#[tokio::test(start_paused = true)]
async fn identical_sends_reconcile_in_arrival_order() {
    let mut h = Harness::online().await;

    h.engine.send_message("ok", Scope::Global);
    h.engine.send_message("ok", Scope::Global);
    let view = h.until("two pending", |v| v.messages.len() == 2).await;
    assert!(view.messages.iter().all(Message::is_pending));

    h.server.push("newMessage", wire("m1", "alice", "ok", None));
    let view = h.until("first confirmed", |v| !v.messages[0].is_pending()).await;
    assert_eq!(view.messages[0].id, MessageId::Confirmed("m1".into()));
    assert!(view.messages[1].is_pending());

    h.server.push("newMessage", wire("m2", "alice", "ok", None));
    let view = h
        .until("both confirmed", |v| v.messages.iter().all(|m| !m.is_pending()))
        .await;
    assert_eq!(ids(&view.messages), vec!["m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_send_times_out() {
    let mut h = Harness::online().await;

    h.engine.send_message("anyone?", Scope::direct("bob"));
    h.until("pending entry", |v| v.messages_all.len() == 1).await;

    match h.notice().await {
        EngineNotice::SendFailed {
            pending_id,
            content,
            error,
        } => {
            assert!(pending_id.is_some());
            assert_eq!(content, "anyone?");
            assert_eq!(error, EngineError::SendTimeout(Duration::from_millis(5000)));
        }
        other => panic!("unexpected notice: {:?}", other),
    }
    h.until("cleanup", |v| v.messages_all.is_empty()).await;

    // A late echo is new content
    h.server.push("newMessage", wire("m7", "alice", "anyone?", Some("bob")));
    let view = h.until("late echo", |v| v.messages_all.len() == 1).await;
    assert_eq!(view.messages_all[0].id, MessageId::Confirmed("m7".into()));

    // A late `messageSent` is not
    h.server.push("messageSent", wire("m8", "alice", "anyone?", Some("bob")));
    settle().await;
    assert_eq!(h.engine.snapshot().messages_all.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn acknowledged_send_waits_for_its_echo() {
    let mut h = Harness::online().await;

    h.engine.send_message("hi", Scope::Global);
    h.until("pending entry", |v| v.messages.len() == 1).await;
    assert!(h.server.ack(h.last_send_ack(), Ok(json!({ "ok": true }))));

    // Well past the send window
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(matches!(
        h.notices.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    let view = h.engine.snapshot();
    assert_eq!(view.messages.len(), 1);
    assert!(view.messages[0].is_pending());

    h.server.push("newMessage", wire("m1", "alice", "hi", None));
    let view = h
        .until("echo", |v| v.messages.iter().all(|m| !m.is_pending()))
        .await;
    assert_eq!(ids(&view.messages_all), vec!["m1"]);
    assert!(matches!(
        h.notices.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(start_paused = true)]
async fn ack_payload_confirms_its_own_send() {
    let mut h = Harness::online().await;

    h.engine.send_message("hi ", Scope::Global);
    h.until("pending entry", |v| v.messages.len() == 1).await;

    // Stored text differs from what was typed
    assert!(h.server.ack(h.last_send_ack(), Ok(wire("m1", "alice", "hi", None))));
    let view = h
        .until("ack", |v| v.messages.iter().all(|m| !m.is_pending()))
        .await;
    assert_eq!(ids(&view.messages_all), vec!["m1"]);

    tokio::time::sleep(Duration::from_secs(6)).await;
    h.server.push("newMessage", wire("m1", "alice", "hi", None));
    settle().await;
    assert_eq!(ids(&h.engine.snapshot().messages_all), vec!["m1"]);
    assert!(matches!(
        h.notices.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test(start_paused = true)]
async fn rejected_send_is_removed() {
    let mut h = Harness::online().await;

    h.engine.send_message("spam", Scope::Global);
    let view = h.until("pending entry", |v| v.messages.len() == 1).await;
    let pending_id = view.messages[0].id.pending_id();
    assert!(pending_id.is_some());
    assert!(h.server.ack(h.last_send_ack(), Err("rate limited".into())));

    assert_eq!(
        h.notice().await,
        EngineNotice::SendFailed {
            pending_id,
            content: "spam".into(),
            error: EngineError::SendRejected("rate limited".into()),
        }
    );
    h.until("removal", |v| v.messages.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn send_while_disconnected_fails_fast() {
    let mut h = Harness::online().await;
    h.server.drop_connection("network down");
    h.until("disconnect", |v| !v.status.is_connected()).await;

    h.engine.send_message("hello", Scope::Global);

    match h.notice().await {
        EngineNotice::SendFailed {
            pending_id: None,
            error: EngineError::Connection(_),
            ..
        } => {}
        other => panic!("unexpected notice: {:?}", other),
    }
    settle().await;
    assert!(h.engine.snapshot().messages_all.is_empty());
    assert!(h.server.emitted_named("sendMessage").is_empty());
}

#[tokio::test(start_paused = true)]
async fn blank_message_is_rejected_without_emitting() {
    let mut h = Harness::online().await;

    h.engine.send_message("  \n\t ", Scope::Global);

    match h.notice().await {
        EngineNotice::SendFailed {
            error: EngineError::SendRejected(_),
            ..
        } => {}
        other => panic!("unexpected notice: {:?}", other),
    }
    assert!(h.server.emitted_named("sendMessage").is_empty());
    assert!(h.engine.snapshot().messages_all.is_empty());
}

// -- Presence & typing --

#[tokio::test(start_paused = true)]
async fn repeated_join_keeps_one_entry() {
    let mut h = Harness::online().await;

    h.server.push("userOnline", json!({ "userId": "bob", "userName": "Bob", "socketId": "s2" }));
    h.server.push("userOnline", json!({ "userId": "bob", "userName": "Bob", "socketId": "s2" }));
    h.server.push("userOnline", json!({ "userId": "alice", "userName": "Alice" }));
    h.server.push("userOffline", json!({ "userId": "carol" }));

    let view = h.until("join", |v| !v.online.is_empty()).await;
    settle().await;
    assert_eq!(h.engine.snapshot().online, view.online);
    assert_eq!(view.online.len(), 1);
    assert_eq!(view.online[0].user_id, "bob");
}

#[tokio::test(start_paused = true)]
async fn typing_burst_emits_one_start_and_one_stop() {
    let h = Harness::online().await;

    for _ in 0..10 {
        h.engine.notify_typing(Scope::Global);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(h.server.emitted_named("typing").len(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(
        h.server.emitted_named("typing"),
        vec![
            json!({ "receiverId": null, "active": true }),
            json!({ "receiverId": null, "active": false }),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn sending_ends_the_typing_burst() {
    let h = Harness::online().await;

    h.engine.notify_typing(Scope::direct("bob"));
    h.engine.send_message("hey", Scope::direct("bob"));
    settle().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let traffic = h.traffic();
    assert_eq!(traffic.len(), 3);
    assert_eq!(
        traffic[0],
        ("typing".to_string(), json!({ "receiverId": "bob", "active": true }))
    );
    assert_eq!(
        traffic[1],
        ("typing".to_string(), json!({ "receiverId": "bob", "active": false }))
    );
    assert_eq!(traffic[2].0, "sendMessage");
    assert_eq!(traffic[2].1["receiverId"], "bob");
}

#[tokio::test(start_paused = true)]
async fn peer_leaving_clears_their_typing() {
    let mut h = Harness::online().await;
    h.server.push("userOnline", json!({ "userId": "bob", "userName": "Bob", "socketId": "s2" }));
    h.server.push(
        "userTyping",
        json!({ "userId": "bob", "userName": "Bob", "isTyping": true }),
    );

    let view = h.until("typing", |v| !v.typing.is_empty()).await;
    assert_eq!(view.typing, vec!["Bob"]);

    h.server.push("userOffline", json!({ "userId": "bob" }));
    h.until("leave", |v| v.typing.is_empty() && v.online.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn connection_loss_clears_presence_and_reconnect_reloads() {
    let mut h = Harness::online().await;
    h.server.push("userOnline", json!({ "userId": "bob", "userName": "Bob", "socketId": "s2" }));
    h.server.push("userTyping", json!({ "userId": "bob", "userName": "Bob", "isTyping": true }));
    h.until("peer", |v| !v.online.is_empty() && !v.typing.is_empty()).await;

    h.server.drop_connection("network down");
    h.until("cleared", |v| {
        !v.status.is_connected() && v.online.is_empty() && v.typing.is_empty()
    })
    .await;

    // Typing is frozen while disconnected
    h.engine.notify_typing(Scope::Global);
    settle().await;
    assert!(h.server.emitted_named("typing").is_empty());

    h.server.restore();
    h.until("reconnected", |v| v.status.is_connected()).await;
    settle().await;
    assert_eq!(h.history.calls(), 2);
    assert_eq!(h.server.emitted_named("getOnlineUsers").len(), 2);
}

// -- Read receipts --

#[tokio::test(start_paused = true)]
async fn direct_message_to_us_sends_read_receipt() {
    let mut h = Harness::online().await;

    h.server.push("newMessage", wire("d1", "bob", "psst", Some("alice")));
    h.server.push("newMessage", wire("d1", "bob", "psst", Some("alice")));
    h.server.push("newMessage", wire("g1", "bob", "hello all", None));
    h.until("messages", |v| v.messages_all.len() == 2).await;
    settle().await;

    assert_eq!(
        h.server.emitted_named("markMessagesAsRead"),
        vec![json!({ "senderId": "bob" })]
    );
}

#[tokio::test(start_paused = true)]
async fn read_at_is_set_once() {
    let mut h = Harness::new();
    h.history.reply(
        Duration::ZERO,
        Ok(vec![
            stored("1", "alice", "did you see this", Some("bob")),
            stored("2", "alice", "to carol", Some("carol")),
        ]),
    );
    h.session.login(alice());
    h.until("history", |v| v.messages_all.len() == 2).await;

    h.server.push(
        "messagesRead",
        json!({ "readerId": "bob", "readAt": "2024-05-01T12:00:00Z" }),
    );
    let view = h.until("read", |v| v.messages_all[0].read_at.is_some()).await;
    let first: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();
    assert_eq!(view.messages_all[0].read_at, Some(first));
    assert_eq!(view.messages_all[1].read_at, None);

    h.server.push(
        "messagesRead",
        json!({ "readerId": "bob", "readAt": "2024-05-01T13:00:00Z" }),
    );
    settle().await;
    assert_eq!(h.engine.snapshot().messages_all[0].read_at, Some(first));
}

// -- Other inbound events --

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_dropped() {
    let mut h = Harness::online().await;

    h.server.push("newMessage", json!({ "content": 5 }));
    match h.notice().await {
        EngineNotice::PayloadDropped(EngineError::MalformedPayload { event, .. }) => {
            assert_eq!(event, "newMessage");
        }
        other => panic!("unexpected notice: {:?}", other),
    }

    h.server.push("newMessage", wire("m1", "bob", "still working", None));
    h.until("next message", |v| v.messages.len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn system_messages_are_appended() {
    let mut h = Harness::online().await;
    h.engine.send_message("restarting?", Scope::Global);
    h.until("pending", |v| v.messages.len() == 1).await;

    h.server.push("systemMessage", json!({ "content": "restarting?" }));
    let view = h.until("system message", |v| v.messages.len() == 2).await;

    assert!(view.messages[0].is_pending());
    assert_eq!(view.messages[1].kind, MessageKind::System);
    assert_eq!(view.messages[1].sender_name, "system");
}

#[tokio::test(start_paused = true)]
async fn unchanged_log_is_shared_between_views() {
    let mut h = Harness::new();
    h.history.reply(Duration::ZERO, Ok(vec![stored("1", "bob", "hello", None)]));
    h.session.login(alice());
    let before = h.until("history", |v| v.messages_all.len() == 1).await;

    h.server.push("userTyping", json!({ "userId": "bob", "userName": "Bob", "isTyping": true }));
    let typing = h.until("typing", |v| !v.typing.is_empty()).await;
    assert!(Arc::ptr_eq(&before.messages_all, &typing.messages_all));
    assert!(Arc::ptr_eq(&before.messages, &typing.messages));

    h.server.push("newMessage", wire("2", "bob", "again", None));
    let after = h.until("message", |v| v.messages_all.len() == 2).await;
    assert!(!Arc::ptr_eq(&typing.messages_all, &after.messages_all));
}

#[tokio::test(start_paused = true)]
async fn scope_filters_messages_and_typing() {
    let mut h = Harness::new();
    h.history.reply(
        Duration::ZERO,
        Ok(vec![
            stored("1", "bob", "global", None),
            stored("2", "bob", "dm in", Some("alice")),
            stored("3", "alice", "dm out", Some("bob")),
            stored("4", "carol", "other dm", Some("alice")),
        ]),
    );
    h.session.login(alice());
    h.until("history", |v| v.messages_all.len() == 4).await;
    h.server.push(
        "userTyping",
        json!({ "userId": "bob", "userName": "Bob", "receiverId": "alice", "isTyping": true }),
    );

    h.engine.select_scope(Scope::direct("bob"));
    let view = h
        .until("direct scope", |v| v.scope == Scope::direct("bob") && !v.typing.is_empty())
        .await;

    assert_eq!(ids(&view.messages), vec!["2", "3"]);
    assert_eq!(view.typing, vec!["Bob"]);

    h.engine.select_scope(Scope::Global);
    let view = h.until("global scope", |v| v.scope == Scope::Global).await;
    assert_eq!(ids(&view.messages), vec!["1"]);
    assert!(view.typing.is_empty());
}

// -- Session boundary --

#[tokio::test(start_paused = true)]
async fn switching_user_replaces_the_session() {
    let mut h = Harness::online().await;
    h.server.push("newMessage", wire("m1", "bob", "for alice's eyes", None));
    h.until("message", |v| v.messages_all.len() == 1).await;

    h.session.login(SessionIdentity::new("bob", "Bob", "token-b"));
    let view = h
        .until("new user", |v| v.user_id.as_deref() == Some("bob"))
        .await;

    assert!(view.messages_all.is_empty());
    assert_eq!(h.server.identity().map(|i| i.user_id), Some("bob".to_string()));
    assert_eq!(h.server.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn same_user_login_is_a_noop() {
    let h = Harness::online().await;
    h.session.login(alice());
    settle().await;

    assert_eq!(h.server.connect_count(), 1);
    assert_eq!(h.history.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_and_is_idempotent() {
    let h = Harness::online().await;
    h.engine.send_message("bye", Scope::Global);
    settle().await;

    h.engine.shutdown().await;
    h.engine.shutdown().await;

    assert_eq!(h.server.identity(), None);
    assert_eq!(h.server.pending_acks(), 0);
    assert!(!h.engine.snapshot().status.is_connected());

    // Commands after shutdown are dropped quietly
    h.engine.send_message("anyone?", Scope::Global);
}
