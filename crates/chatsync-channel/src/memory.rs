use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use chatsync_types::SessionIdentity;

use crate::dispatcher::{Dispatcher, SubscriptionId};
use crate::error::ChannelError;
use crate::{AckCallback, AckResult, Channel, ConnectionStatus, Handler};

/// One event the client emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub event: String,
    pub payload: Value,
    /// Ack id, if the client asked for an acknowledgement.
    pub ack: Option<u64>,
}

#[derive(Default)]
struct MemoryState {
    identity: Option<SessionIdentity>,
    connects: usize,
    fail_next_connect: Option<String>,
    emitted: Vec<Emitted>,
}

/// In-process [`Channel`] for tests and demos.
///
/// Everything is synchronous: `connect` completes (or fails) before it
/// returns, and events pushed through the paired [`MemoryServer`] reach the
/// subscribers on the caller's task.
pub struct MemoryChannel {
    dispatcher: Dispatcher,
    state: Arc<Mutex<MemoryState>>,
}

/// The "server side" of a [`MemoryChannel`].
#[derive(Clone)]
pub struct MemoryServer {
    dispatcher: Dispatcher,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    pub fn new() -> (Self, MemoryServer) {
        let dispatcher = Dispatcher::new();
        let state = Arc::new(Mutex::new(MemoryState::default()));
        let server = MemoryServer {
            dispatcher: dispatcher.clone(),
            state: state.clone(),
        };
        (Self { dispatcher, state }, server)
    }
}

impl Channel for MemoryChannel {
    fn connect(&self, identity: &SessionIdentity) {
        let (replaced, failure) = {
            let mut state = self.state.lock();
            let live = self.dispatcher.current_status().is_connected();
            if live && state.identity.as_ref() == Some(identity) {
                return;
            }
            let replaced = live && state.identity.is_some();
            state.identity = Some(identity.clone());
            state.connects += 1;
            (replaced, state.fail_next_connect.take())
        };

        if replaced {
            self.dispatcher.disconnected(Some("identity changed"));
        }
        match failure {
            Some(message) => self.dispatcher.connect_failed(&message),
            None => self.dispatcher.connected(),
        }
    }

    fn disconnect(&self) {
        let had_session = self.state.lock().identity.take().is_some();
        if !had_session {
            return;
        }
        if self.dispatcher.current_status().is_connected() {
            self.dispatcher.disconnected(Some("client disconnect"));
        } else {
            self.dispatcher.abandon_acks();
            self.dispatcher.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn emit(&self, event: &str, payload: Value, ack: Option<AckCallback>) -> Result<(), ChannelError> {
        if !self.dispatcher.current_status().is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let ack = ack.map(|callback| self.dispatcher.register_ack(callback));
        self.state.lock().emitted.push(Emitted {
            event: event.to_string(),
            payload,
            ack,
        });
        Ok(())
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

impl MemoryServer {
    /// Deliver an inbound event to the client.
    pub fn push(&self, event: &str, data: Value) {
        self.dispatcher.deliver(event, &data);
    }

    /// Answer the ack with the given id. Returns false if nobody was waiting.
    pub fn ack(&self, id: u64, result: AckResult) -> bool {
        self.dispatcher.resolve_ack(id, result)
    }

    pub fn emitted(&self) -> Vec<Emitted> {
        self.state.lock().emitted.clone()
    }

    /// Payloads of every emitted event with this name, oldest first.
    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        self.state
            .lock()
            .emitted
            .iter()
            .filter(|e| e.event == event)
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn take_emitted(&self) -> Vec<Emitted> {
        std::mem::take(&mut self.state.lock().emitted)
    }

    /// Identity of the current (or last attempted) connection.
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.state.lock().identity.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn pending_acks(&self) -> usize {
        self.dispatcher.pending_acks()
    }

    /// Make the next `connect` fail with this message.
    pub fn fail_next_connect(&self, message: &str) {
        self.state.lock().fail_next_connect = Some(message.to_string());
    }

    /// Simulate the transport dropping. The client keeps its identity.
    pub fn drop_connection(&self, reason: &str) {
        if self.dispatcher.current_status().is_connected() {
            self.dispatcher.disconnected(Some(reason));
        }
    }

    /// Bring a dropped connection back, as a transport-level reconnect would.
    pub fn restore(&self) {
        let has_identity = self.state.lock().identity.is_some();
        if has_identity && !self.dispatcher.current_status().is_connected() {
            self.dispatcher.connected();
        }
    }
}
