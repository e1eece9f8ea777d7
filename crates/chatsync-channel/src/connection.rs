use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use chatsync_types::{Frame, SessionIdentity};

use crate::dispatcher::{Dispatcher, SubscriptionId};
use crate::error::ChannelError;
use crate::{AckCallback, Channel, ConnectionStatus, Handler};

/// Ping every 15 seconds; two missed Pongs (~30s) drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up. Zero disables reconnecting.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Gateway endpoint, e.g. `ws://localhost:3000/gateway`.
    pub url: String,
    pub heartbeat: Duration,
    pub reconnect: ReconnectConfig,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: HEARTBEAT_INTERVAL,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// WebSocket implementation of [`Channel`].
pub struct WsChannel {
    config: WsConfig,
    dispatcher: Dispatcher,
    session: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    identity: SessionIdentity,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum ConnectionEnd {
    Cancelled,
    Dropped(String),
}

impl WsChannel {
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            dispatcher: Dispatcher::new(),
            session: Mutex::new(None),
        }
    }

    fn handshake_url(&self, identity: &SessionIdentity) -> Result<Url, ChannelError> {
        let mut url =
            Url::parse(&self.config.url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("userId", &identity.user_id)
            .append_pair("userName", &identity.user_name)
            .append_pair("token", &identity.token);
        Ok(url)
    }

    /// Stop a session. Runs synchronously so no ack can fire after this returns.
    fn teardown(&self, session: ActiveSession, reason: &str) {
        session.cancel.cancel();
        self.dispatcher.end_session();
        if self.dispatcher.current_status().is_connected() {
            self.dispatcher.disconnected(Some(reason));
        } else {
            self.dispatcher.abandon_acks();
            self.dispatcher.set_status(ConnectionStatus::Disconnected);
        }
        info!(user_id = %session.identity.user_id, "gateway session closed ({})", reason);
    }
}

impl Channel for WsChannel {
    fn connect(&self, identity: &SessionIdentity) {
        let previous = {
            let mut guard = self.session.lock();
            if let Some(active) = guard.as_ref() {
                if active.identity == *identity && !active.task.is_finished() {
                    debug!(user_id = %identity.user_id, "connect ignored: session already live");
                    return;
                }
            }
            guard.take()
        };
        // Handlers run during teardown, so the session lock must not be held
        if let Some(previous) = previous {
            self.teardown(previous, "identity changed");
        }

        let url = match self.handshake_url(identity) {
            Ok(url) => url,
            Err(e) => {
                warn!("{}", e);
                self.dispatcher.connect_failed(&e.to_string());
                return;
            }
        };

        let generation = self.dispatcher.begin_session();
        self.dispatcher.set_status(ConnectionStatus::Connecting);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            url,
            self.config.clone(),
            self.dispatcher.clone(),
            generation,
            outbound_rx,
            cancel.clone(),
        ));

        *self.session.lock() = Some(ActiveSession {
            identity: identity.clone(),
            outbound,
            cancel,
            task,
        });
    }

    fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.teardown(session, "client disconnect");
        }
    }

    fn emit(&self, event: &str, payload: Value, ack: Option<AckCallback>) -> Result<(), ChannelError> {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(ChannelError::NotConnected)?;
        if !self.dispatcher.current_status().is_connected() {
            return Err(ChannelError::NotConnected);
        }

        let ack_id = ack.map(|callback| self.dispatcher.register_ack(callback));
        let frame = Frame::Event {
            event: event.to_string(),
            data: payload,
            ack: ack_id,
        };

        session.outbound.send(frame).map_err(|_| {
            if let Some(id) = ack_id {
                self.dispatcher.forget_ack(id);
            }
            ChannelError::NotConnected
        })
    }

    fn subscribe(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.dispatcher.subscribe(event, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.dispatcher.unsubscribe(id);
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.dispatcher.status()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            self.dispatcher.end_session();
        }
    }
}

/// Connect, run, and reconnect with backoff until cancelled or out of attempts.
///
/// Every dispatcher call is tagged with `generation`; once the channel ends
/// that lifetime the task can no longer touch status or handlers.
async fn run_session(
    url: Url,
    config: WsConfig,
    dispatcher: Dispatcher,
    generation: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    let reconnect = config.reconnect;
    let mut delay = reconnect.initial_delay;
    let mut failures: u32 = 0;

    loop {
        if cancel.is_cancelled()
            || !dispatcher.set_status_as(generation, ConnectionStatus::Connecting)
        {
            return;
        }

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        match attempt {
            Ok((socket, _)) => {
                failures = 0;
                delay = reconnect.initial_delay;
                if cancel.is_cancelled() || !dispatcher.connected_as(generation) {
                    debug!("handshake finished after the session ended");
                    return;
                }
                info!("connected to gateway {}", redact(&url));

                let end = run_connection(
                    socket,
                    &dispatcher,
                    generation,
                    &mut outbound_rx,
                    &cancel,
                    config.heartbeat,
                )
                .await;

                // Frames queued for the dead socket must not leak onto the next one
                while outbound_rx.try_recv().is_ok() {}

                match end {
                    // teardown() already announced the disconnect
                    ConnectionEnd::Cancelled => return,
                    ConnectionEnd::Dropped(reason) => {
                        warn!("gateway connection dropped: {}", reason);
                        if !dispatcher.disconnected_as(generation, Some(&reason)) {
                            return;
                        }
                        if reconnect.max_attempts == 0 {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                let error = ChannelError::Connect(e.to_string());
                warn!(attempt = failures, "{}", error);
                if failures > reconnect.max_attempts {
                    dispatcher.connect_failed_as(generation, &error.to_string());
                    return;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(reconnect.max_delay);
    }
}

/// Pump one live socket: outbound frames, inbound frames and the heartbeat.
async fn run_connection(
    socket: Socket,
    dispatcher: &Dispatcher,
    generation: u64,
    outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
    cancel: &CancellationToken,
    heartbeat_interval: Duration,
) -> ConnectionEnd {
    let (mut sink, mut stream) = socket.split();

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut pong_received = true;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return ConnectionEnd::Cancelled;
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return ConnectionEnd::Cancelled;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return ConnectionEnd::Dropped(ChannelError::Transport(e.to_string()).to_string());
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => handle_frame(dispatcher, generation, text.as_str()),
                    Some(Ok(Message::Pong(_))) => pong_received = true,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return ConnectionEnd::Dropped(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return ConnectionEnd::Dropped(ChannelError::Transport(e.to_string()).to_string());
                    }
                    None => return ConnectionEnd::Dropped("stream ended".to_string()),
                }
            }

            _ = heartbeat.tick() => {
                if pong_received {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        return ConnectionEnd::Dropped(format!(
                            "heartbeat timeout (missed {} pongs)",
                            missed_heartbeats
                        ));
                    }
                }
                pong_received = false;
                trace!("heartbeat ping");
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    return ConnectionEnd::Dropped("ping failed".to_string());
                }
            }
        }
    }
}

fn handle_frame(dispatcher: &Dispatcher, generation: u64, text: &str) {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Event { event, data, .. }) => {
            trace!(event = %event, "inbound event");
            if !dispatcher.deliver_as(generation, &event, &data) {
                trace!(event = %event, "event from an ended connection dropped");
            }
        }
        Ok(Frame::Ack { id, data, error }) => {
            let result = match error {
                Some(error) => Err(error),
                None => Ok(data),
            };
            if !dispatcher.resolve_ack(id, result) {
                debug!("ack {} arrived with no waiting callback", id);
            }
        }
        Err(e) => {
            let raw: String = text.chars().take(200).collect();
            warn!("bad frame: {} -- raw: {}", e, raw);
        }
    }
}

/// Gateway URL without the query, which carries the token.
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
