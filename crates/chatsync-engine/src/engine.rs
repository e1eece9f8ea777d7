use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chatsync_channel::{AckCallback, AckResult, Channel, ChannelError, ConnectionStatus, SubscriptionId};
use chatsync_types::events::{MessagePayload, SendMessagePayload, inbound, outbound};
use chatsync_types::{
    InboundEvent, Message, MessageKind, OutboundCommand, PresenceEntry, Scope, SessionIdentity,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, LoadError};
use crate::history::HistorySource;
use crate::presence::PresenceTracker;
use crate::store::{MessageStore, Reconciled};
use crate::typing::{TypingCoordinator, TypingSignal};

const NOTICE_CAPACITY: usize = 64;

/// Read-only snapshot of the chat, republished after every change.
#[derive(Debug, Clone, Default)]
pub struct ChatView {
    /// Id of the signed-in user, if any.
    pub user_id: Option<String>,
    pub status: ConnectionStatus,
    pub scope: Scope,
    /// The log filtered to `scope`.
    pub messages: Arc<[Message]>,
    /// The whole log, for consumers that filter themselves.
    pub messages_all: Arc<[Message]>,
    pub online: Vec<PresenceEntry>,
    /// Names of peers typing in `scope`.
    pub typing: Vec<String>,
    pub load_error: Option<LoadError>,
}

impl PartialEq for ChatView {
    fn eq(&self, other: &Self) -> bool {
        // Log slices are usually shared with the previous view
        fn same(a: &Arc<[Message]>, b: &Arc<[Message]>) -> bool {
            Arc::ptr_eq(a, b) || a == b
        }

        self.user_id == other.user_id
            && self.status == other.status
            && self.scope == other.scope
            && same(&self.messages, &other.messages)
            && same(&self.messages_all, &other.messages_all)
            && self.online == other.online
            && self.typing == other.typing
            && self.load_error == other.load_error
    }
}

impl ChatView {
    /// Online count as shown to the user, who counts themselves.
    pub fn display_count(&self) -> usize {
        self.online.len() + usize::from(self.user_id.is_some())
    }
}

/// Something the user should hear about once.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    SendFailed {
        /// Absent when the send never got as far as the log.
        pending_id: Option<Uuid>,
        content: String,
        error: EngineError,
    },
    LoadFailed(LoadError),
    /// An inbound event failed validation and was dropped.
    PayloadDropped(EngineError),
    SessionEnded,
}

enum Command {
    Send { content: String, scope: Scope },
    Typing(Scope),
    SelectScope(Scope),
    Reconnect,
    Shutdown,
}

/// Everything the actor reacts to. Async results carry the epoch of the
/// session that started them; loads also carry their sequence number.
enum Input {
    Event {
        epoch: u64,
        event: &'static str,
        data: Value,
    },
    Ack {
        epoch: u64,
        pending_id: Uuid,
        result: AckResult,
    },
    History {
        epoch: u64,
        seq: u64,
        result: Result<Vec<Message>, LoadError>,
    },
    Command(Command),
}

/// Cheap, cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Receiver<ChatView>,
    notices: broadcast::Sender<EngineNotice>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Send `content` to `scope` optimistically. Failures arrive as notices.
    pub fn send_message(&self, content: impl Into<String>, scope: Scope) {
        self.command(Command::Send {
            content: content.into(),
            scope,
        });
    }

    /// Report a local keystroke in `scope`.
    pub fn notify_typing(&self, scope: Scope) {
        self.command(Command::Typing(scope));
    }

    pub fn select_scope(&self, scope: Scope) {
        self.command(Command::SelectScope(scope));
    }

    /// Drop and re-open the connection for the current user.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Disconnect and stop the engine. Idempotent.
    pub async fn shutdown(&self) {
        self.command(Command::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("engine task ended abnormally: {}", e);
            }
        }
    }

    pub fn view(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    fn command(&self, command: Command) {
        if self.inputs.send(Input::Command(command)).is_err() {
            debug!("engine stopped, command dropped");
        }
    }
}

/// Start the engine on the current tokio runtime.
///
/// The engine follows `session`: a user connects `channel` as that user, a
/// different user replaces the session, `None` tears it down.
pub fn spawn(
    config: EngineConfig,
    channel: Arc<dyn Channel>,
    history: Arc<dyn HistorySource>,
    session: watch::Receiver<Option<SessionIdentity>>,
) -> EngineHandle {
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(ChatView::default());
    let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
    let channel_status = channel.status();

    let actor = Actor {
        config,
        channel,
        history,
        inputs: inputs_tx.clone(),
        view: view_tx,
        notices: notices.clone(),
        epoch: 0,
        load_seq: 0,
        scope: Scope::Global,
        status: channel_status,
        live: None,
    };
    let task = tokio::spawn(actor.run(inputs_rx, session));

    EngineHandle {
        inputs: inputs_tx,
        view: view_rx,
        notices,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

/// State of the signed-in session. Dropped wholesale on teardown.
struct Live {
    identity: SessionIdentity,
    subscriptions: Vec<SubscriptionId>,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    store: MessageStore,
    load: Option<JoinHandle<()>>,
    load_error: Option<LoadError>,
    shared: Option<SharedLog>,
}

/// Log slices last handed to the view, reused while the store is unchanged.
struct SharedLog {
    revision: u64,
    scope: Scope,
    visible: Arc<[Message]>,
    all: Arc<[Message]>,
}

impl Live {
    fn shared_log(&mut self, scope: &Scope) -> (Arc<[Message]>, Arc<[Message]>) {
        let revision = self.store.revision();
        if let Some(shared) = &self.shared {
            if shared.revision == revision && shared.scope == *scope {
                return (shared.visible.clone(), shared.all.clone());
            }
        }

        let shared = SharedLog {
            revision,
            scope: scope.clone(),
            visible: self.store.visible(scope).into(),
            all: self.store.all().into(),
        };
        let slices = (shared.visible.clone(), shared.all.clone());
        self.shared = Some(shared);
        slices
    }
}

struct Actor {
    config: EngineConfig,
    channel: Arc<dyn Channel>,
    history: Arc<dyn HistorySource>,
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Sender<ChatView>,
    notices: broadcast::Sender<EngineNotice>,

    /// Bumped on every session start and teardown.
    epoch: u64,
    load_seq: u64,

    scope: Scope,
    /// Read fresh on every publish; changes only wake the loop.
    status: watch::Receiver<ConnectionStatus>,
    live: Option<Live>,
}

impl Actor {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut session: watch::Receiver<Option<SessionIdentity>>,
    ) {
        let initial = session.borrow_and_update().clone();
        self.on_session(initial);
        self.publish();

        let mut session_open = true;
        let mut status_open = true;

        loop {
            let deadline = self.next_deadline();
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    if !self.handle(input) {
                        break;
                    }
                }

                changed = session.changed(), if session_open => {
                    match changed {
                        Ok(()) => {
                            let identity = session.borrow_and_update().clone();
                            self.on_session(identity);
                        }
                        Err(_) => {
                            debug!("session boundary dropped");
                            session_open = false;
                        }
                    }
                }

                changed = self.status.changed(), if status_open => {
                    match changed {
                        Ok(()) => {
                            let status = self.status.borrow_and_update().clone();
                            debug!(%status, "channel status");
                        }
                        Err(_) => status_open = false,
                    }
                }

                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    self.on_timers(Instant::now());
                }
            }

            self.publish();
        }

        self.teardown();
        self.publish();
        info!("chat engine stopped");
    }

    /// Returns false when the engine should stop.
    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Event { epoch, event, data } => self.on_event(epoch, event, &data),
            Input::Ack {
                epoch,
                pending_id,
                result,
            } => self.on_ack(epoch, pending_id, result),
            Input::History { epoch, seq, result } => self.on_history(epoch, seq, result),
            Input::Command(Command::Shutdown) => {
                info!("engine shutdown requested");
                return false;
            }
            Input::Command(command) => self.on_command(command),
        }
        true
    }

    // -- Session lifecycle --

    fn on_session(&mut self, identity: Option<SessionIdentity>) {
        match identity {
            Some(identity) => {
                if self.live.as_ref().is_some_and(|live| live.identity == identity) {
                    return;
                }
                self.teardown();
                self.start(identity);
            }
            None => {
                if self.live.is_some() {
                    self.teardown();
                    self.notify(EngineNotice::SessionEnded);
                }
            }
        }
    }

    fn start(&mut self, identity: SessionIdentity) {
        self.epoch += 1;
        let epoch = self.epoch;
        info!(user_id = %identity.user_id, epoch, "starting chat session");

        let subscriptions: Vec<SubscriptionId> = inbound::ALL
            .iter()
            .map(|&event| {
                let inputs = self.inputs.clone();
                self.channel.subscribe(
                    event,
                    Arc::new(move |data: &Value| {
                        let _ = inputs.send(Input::Event {
                            epoch,
                            event,
                            data: data.clone(),
                        });
                    }),
                )
            })
            .collect();

        let user_id = identity.user_id.clone();
        self.scope = Scope::Global;
        self.live = Some(Live {
            subscriptions,
            presence: PresenceTracker::new(user_id.clone()),
            typing: TypingCoordinator::new(user_id.clone(), self.config.typing_idle),
            store: MessageStore::new(user_id, self.config.send_timeout),
            load: None,
            load_error: None,
            shared: None,
            identity: identity.clone(),
        });

        self.channel.connect(&identity);
    }

    /// Close the channel and forget the session. Everything still in flight
    /// for it is discarded when it arrives.
    fn teardown(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };

        if live.typing.cancel() {
            trace!("typing burst cancelled by teardown");
        }
        if let Some(load) = live.load.take() {
            load.abort();
        }

        // The disconnect event this raises still carries the old epoch
        self.channel.disconnect();
        for id in live.subscriptions.drain(..) {
            self.channel.unsubscribe(id);
        }
        self.epoch += 1;

        info!(
            user_id = %live.identity.user_id,
            pending = live.store.pending_count(),
            "chat session closed"
        );
    }

    // -- Channel events --

    fn on_event(&mut self, epoch: u64, event: &str, data: &Value) {
        if epoch != self.epoch {
            trace!(event, "dropping event from a closed session");
            return;
        }

        match InboundEvent::decode(event, data) {
            Ok(Some(decoded)) => self.apply(decoded),
            Ok(None) => debug!(event, "ignoring unknown event"),
            Err(e) => {
                warn!("{} -- raw: {}", e, data);
                self.notify(EngineNotice::PayloadDropped(e.into()));
            }
        }
    }

    fn apply(&mut self, event: InboundEvent) {
        let Some(live) = self.live.as_mut() else {
            return;
        };

        match event {
            InboundEvent::Connected => {
                info!(user_id = %live.identity.user_id, "channel connected");
                self.load_seq += 1;
                if let Some(stale) = live.load.take() {
                    stale.abort();
                }
                live.load = Some(spawn_load(
                    self.history.as_ref(),
                    &live.identity,
                    self.inputs.clone(),
                    self.epoch,
                    self.load_seq,
                ));
                if let Err(e) = emit(self.channel.as_ref(), &OutboundCommand::GetOnlineUsers) {
                    warn!("presence request failed: {}", e);
                }
            }

            InboundEvent::Disconnected { reason } => {
                info!(
                    user_id = %live.identity.user_id,
                    "channel disconnected ({})",
                    reason.as_deref().unwrap_or("no reason")
                );
                freeze(live);
            }

            InboundEvent::ConnectError { message } => {
                warn!(user_id = %live.identity.user_id, "channel connect error: {}", message);
                freeze(live);
            }

            InboundEvent::OnlineUsers(users) => {
                let departed = live
                    .presence
                    .on_snapshot(users.into_iter().map(PresenceEntry::from));
                for user_id in departed {
                    live.typing.drop_peer(&user_id);
                }
                debug!(online = live.presence.online_count(), "presence snapshot");
            }

            InboundEvent::UserOnline(user) => {
                if live.presence.on_join(user.into()) {
                    debug!(online = live.presence.online_count(), "peer joined");
                }
            }

            InboundEvent::UserOffline(user) => {
                live.presence.on_leave(&user.user_id);
                live.typing.drop_peer(&user.user_id);
            }

            InboundEvent::NewMessage(payload) => {
                let message = match payload.into_message(inbound::NEW_MESSAGE) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("{}", e);
                        notify(&self.notices, EngineNotice::PayloadDropped(e.into()));
                        return;
                    }
                };

                let receipt = live
                    .store
                    .needs_read_receipt(&message)
                    .then(|| message.sender_id.clone());
                let outcome = live.store.reconcile(message);
                debug!(?outcome, "new message");

                if let (Some(sender_id), true) = (receipt, outcome != Reconciled::Duplicate) {
                    let command = OutboundCommand::MarkMessagesAsRead { sender_id };
                    if let Err(e) = emit(self.channel.as_ref(), &command) {
                        debug!("read receipt not sent: {}", e);
                    }
                }
            }

            InboundEvent::MessageSent(payload) => match payload.into_message(inbound::MESSAGE_SENT) {
                Ok(message) => {
                    let outcome = live.store.confirm(message);
                    debug!(?outcome, "send confirmed");
                }
                Err(e) => {
                    warn!("{}", e);
                    notify(&self.notices, EngineNotice::PayloadDropped(e.into()));
                }
            },

            InboundEvent::MessagesRead(receipt) => {
                let read_at = receipt.read_at.unwrap_or_else(Utc::now);
                let marked = live.store.mark_read_by(&receipt.reader_id, read_at);
                debug!(reader = %receipt.reader_id, marked, "messages read");
            }

            InboundEvent::UserTyping(signal) => {
                live.typing.on_signal(signal);
            }

            InboundEvent::SystemMessage(payload) => {
                live.store.append(payload.into_message(Utc::now()));
            }
        }
    }

    fn on_ack(&mut self, epoch: u64, pending_id: Uuid, result: AckResult) {
        if epoch != self.epoch {
            trace!(%pending_id, "dropping ack from a closed session");
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };

        let rejection = match result {
            Err(error) => Some(error),
            Ok(value) => match value.get("error").and_then(Value::as_str) {
                Some(error) => Some(error.to_string()),
                None => {
                    // Accepted: the send can no longer time out
                    live.store.acknowledge(pending_id);

                    // Acks may carry the stored message; the echo confirms it otherwise
                    let confirmed = MessagePayload::deserialize(&value)
                        .ok()
                        .and_then(|p| p.into_message(outbound::SEND_MESSAGE).ok());
                    match confirmed {
                        Some(message) => {
                            let outcome = live.store.settle(pending_id, message);
                            debug!(%pending_id, ?outcome, "send acknowledged");
                        }
                        None => debug!(%pending_id, "send acknowledged, awaiting echo"),
                    }
                    None
                }
            },
        };

        if let Some(error) = rejection {
            if let Some(message) = live.store.discard(pending_id) {
                warn!(%pending_id, "send rejected: {}", error);
                notify(
                    &self.notices,
                    EngineNotice::SendFailed {
                        pending_id: Some(pending_id),
                        content: message.content,
                        error: EngineError::SendRejected(error),
                    },
                );
            }
        }
    }

    fn on_history(&mut self, epoch: u64, seq: u64, result: Result<Vec<Message>, LoadError>) {
        if epoch != self.epoch || seq != self.load_seq {
            debug!(epoch, seq, "discarding stale history result");
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };
        live.load = None;

        match result {
            Ok(messages) => {
                info!("loaded {} messages", messages.len());
                live.store.load(messages);
                live.load_error = None;
            }
            Err(e) => {
                warn!("history load failed: {}", e);
                live.store.load(Vec::new());
                live.load_error = Some(e.clone());
                notify(&self.notices, EngineNotice::LoadFailed(e));
            }
        }
    }

    // -- Commands --

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { content, scope } => self.send(content, scope),

            Command::Typing(scope) => {
                if !self.status.borrow().is_connected() {
                    return;
                }
                let Some(live) = self.live.as_mut() else {
                    return;
                };
                for signal in live.typing.keystroke(&scope, Instant::now()) {
                    send_typing(self.channel.as_ref(), &signal);
                }
            }

            Command::SelectScope(scope) => {
                debug!(scope = %scope, "scope selected");
                self.scope = scope;
            }

            Command::Reconnect => {
                let Some(identity) = self.live.as_ref().map(|live| live.identity.clone()) else {
                    debug!("reconnect ignored: no session");
                    return;
                };
                info!(user_id = %identity.user_id, "reconnecting");
                self.channel.disconnect();
                self.channel.connect(&identity);
            }

            // Handled by the loop
            Command::Shutdown => {}
        }
    }

    fn send(&mut self, content: String, scope: Scope) {
        let Some(live) = self.live.as_mut() else {
            notify(
                &self.notices,
                EngineNotice::SendFailed {
                    pending_id: None,
                    content,
                    error: EngineError::Connection("no active session".to_string()),
                },
            );
            return;
        };

        if content.trim().is_empty() {
            notify(
                &self.notices,
                EngineNotice::SendFailed {
                    pending_id: None,
                    content,
                    error: EngineError::SendRejected("message is empty".to_string()),
                },
            );
            return;
        }

        if let Some(signal) = live.typing.stop() {
            send_typing(self.channel.as_ref(), &signal);
        }

        let pending_id = live.store.push_pending(
            content.clone(),
            &scope,
            live.identity.user_name.clone(),
            Instant::now(),
        );
        let command = OutboundCommand::SendMessage(SendMessagePayload {
            content: content.clone(),
            receiver_id: scope.receiver_id().map(str::to_string),
            kind: MessageKind::Text,
            client_id: pending_id,
        });

        let inputs = self.inputs.clone();
        let epoch = self.epoch;
        let ack: AckCallback = Box::new(move |result: AckResult| {
            let _ = inputs.send(Input::Ack {
                epoch,
                pending_id,
                result,
            });
        });

        match self
            .channel
            .emit(command.event_name(), command.payload(), Some(ack))
        {
            Ok(()) => debug!(%pending_id, scope = %scope, "message sent"),
            Err(e) => {
                // Never reached the wire, so it never joins the log
                live.store.discard(pending_id);
                warn!(%pending_id, "send failed: {}", e);
                notify(
                    &self.notices,
                    EngineNotice::SendFailed {
                        pending_id: None,
                        content,
                        error: e.into(),
                    },
                );
            }
        }
    }

    // -- Timers --

    fn next_deadline(&self) -> Option<Instant> {
        let live = self.live.as_ref()?;
        match (live.typing.deadline(), live.store.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_timers(&mut self, now: Instant) {
        let Some(live) = self.live.as_mut() else {
            return;
        };

        if let Some(signal) = live.typing.poll_expired(now) {
            send_typing(self.channel.as_ref(), &signal);
        }

        for message in live.store.expire(now) {
            warn!(id = %message.id, "send timed out");
            notify(
                &self.notices,
                EngineNotice::SendFailed {
                    pending_id: message.id.pending_id(),
                    content: message.content,
                    error: EngineError::SendTimeout(self.config.send_timeout),
                },
            );
        }
    }

    // -- Output --

    fn snapshot(&mut self) -> ChatView {
        let status = self.status.borrow().clone();
        let Some(live) = self.live.as_mut() else {
            return ChatView {
                status,
                scope: self.scope.clone(),
                ..ChatView::default()
            };
        };

        let (messages, messages_all) = live.shared_log(&self.scope);
        ChatView {
            user_id: Some(live.identity.user_id.clone()),
            status,
            scope: self.scope.clone(),
            messages,
            messages_all,
            online: live.presence.peers().to_vec(),
            typing: live.typing.names_in(&self.scope),
            load_error: live.load_error.clone(),
        }
    }

    fn publish(&mut self) {
        let next = self.snapshot();
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn notify(&self, notice: EngineNotice) {
        notify(&self.notices, notice);
    }
}

/// Connection lost: presence and inbound typing are void, outbound typing stops silently.
fn freeze(live: &mut Live) {
    live.presence.clear();
    live.typing.clear_peers();
    live.typing.cancel();
}

fn spawn_load(
    history: &dyn HistorySource,
    identity: &SessionIdentity,
    inputs: mpsc::UnboundedSender<Input>,
    epoch: u64,
    seq: u64,
) -> JoinHandle<()> {
    debug!(user_id = %identity.user_id, seq, "loading history");
    let fetch = history.fetch(identity);
    tokio::spawn(async move {
        let result = fetch.await;
        let _ = inputs.send(Input::History { epoch, seq, result });
    })
}

fn emit(channel: &dyn Channel, command: &OutboundCommand) -> Result<(), ChannelError> {
    channel.emit(command.event_name(), command.payload(), None)
}

fn send_typing(channel: &dyn Channel, signal: &TypingSignal) {
    let command = OutboundCommand::Typing {
        receiver_id: signal.scope.receiver_id().map(str::to_string),
        active: signal.active,
    };
    match emit(channel, &command) {
        Ok(()) => trace!(scope = %signal.scope, active = signal.active, "typing"),
        Err(e) => debug!("typing signal not sent: {}", e),
    }
}

fn notify(notices: &broadcast::Sender<EngineNotice>, notice: EngineNotice) {
    // No receivers is fine
    let _ = notices.send(notice);
}
