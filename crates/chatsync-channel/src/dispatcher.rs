use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace};

use chatsync_types::events::inbound;

use crate::{AckCallback, AckResult, ConnectionStatus, Handler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handler registry, ack table and status for one channel.
///
/// Transport implementations feed it raw events and lifecycle transitions;
/// it owns the delivery rules (arrival order, pause while disconnected,
/// abandon acks on drop).
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// event name -> handlers in registration order
    handlers: Mutex<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_subscription: AtomicU64,

    /// ack id -> callback waiting for the server's answer
    acks: Mutex<HashMap<u64, AckCallback>>,
    next_ack: AtomicU64,

    /// Data events are dropped while paused. Lifecycle events always go through.
    paused: AtomicBool,

    status_tx: watch::Sender<ConnectionStatus>,

    /// Current connection lifetime. Held while a tagged lifecycle call runs,
    /// so a lifetime cannot end halfway through announcing itself.
    generation: ReentrantMutex<Cell<u64>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(DispatcherInner {
                handlers: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                acks: Mutex::new(HashMap::new()),
                next_ack: AtomicU64::new(1),
                paused: AtomicBool::new(true),
                status_tx,
                generation: ReentrantMutex::new(Cell::new(0)),
            }),
        }
    }

    pub fn subscribe(&self, event: &str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner.handlers.lock().get(event).map_or(0, Vec::len)
    }

    /// Deliver an inbound data event to its subscribers.
    pub fn deliver(&self, event: &str, data: &Value) {
        if self.inner.paused.load(Ordering::Acquire) {
            trace!(event, "dropping event while paused");
            return;
        }
        self.dispatch(event, data);
    }

    fn dispatch(&self, event: &str, data: &Value) {
        // Clone handlers out so a handler may (un)subscribe without deadlocking
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(data);
        }
    }

    // -- Acknowledgements --

    pub fn register_ack(&self, callback: AckCallback) -> u64 {
        let id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        self.inner.acks.lock().insert(id, callback);
        id
    }

    /// Run and remove the callback for `id`. Returns false if nobody was waiting.
    pub fn resolve_ack(&self, id: u64, result: AckResult) -> bool {
        let callback = self.inner.acks.lock().remove(&id);
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Drop the callback for `id` without running it.
    pub fn forget_ack(&self, id: u64) {
        self.inner.acks.lock().remove(&id);
    }

    /// Drop every outstanding callback without running it.
    pub fn abandon_acks(&self) -> usize {
        let abandoned: Vec<AckCallback> = self.inner.acks.lock().drain().map(|(_, cb)| cb).collect();
        if !abandoned.is_empty() {
            debug!("abandoning {} outstanding acks", abandoned.len());
        }
        abandoned.len()
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.acks.lock().len()
    }

    // -- Status & lifecycle --

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.inner.status_tx.send_replace(status);
    }

    /// Handshake finished: resume delivery and announce `connect`.
    pub fn connected(&self) {
        self.set_status(ConnectionStatus::Connected);
        self.inner.paused.store(false, Ordering::Release);
        self.dispatch(inbound::CONNECT, &Value::Null);
    }

    /// Connection lost or closed: abandon acks, announce `disconnect`, pause delivery.
    pub fn disconnected(&self, reason: Option<&str>) {
        self.abandon_acks();
        self.inner.paused.store(true, Ordering::Release);
        self.set_status(ConnectionStatus::Disconnected);
        let data = reason.map_or(Value::Null, |r| Value::String(r.to_string()));
        self.dispatch(inbound::DISCONNECT, &data);
    }

    /// A connection attempt failed for good.
    pub fn connect_failed(&self, message: &str) {
        self.abandon_acks();
        self.inner.paused.store(true, Ordering::Release);
        self.set_status(ConnectionStatus::Error(message.to_string()));
        self.dispatch(inbound::CONNECT_ERROR, &Value::String(message.to_string()));
    }
}

// -- Connection lifetimes --
//
// A transport task is tagged with the generation it was started under. Once the
// channel ends that lifetime, every tagged call from the task is a no-op.
impl Dispatcher {
    /// Start a new lifetime and return its tag.
    pub fn begin_session(&self) -> u64 {
        let generation = self.inner.generation.lock();
        generation.set(generation.get() + 1);
        generation.get()
    }

    /// End the current lifetime. Waits for a tagged call in progress.
    pub fn end_session(&self) {
        let generation = self.inner.generation.lock();
        generation.set(generation.get() + 1);
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.lock().get() == generation
    }

    /// Returns false, doing nothing, when `generation` has ended.
    pub fn connected_as(&self, generation: u64) -> bool {
        self.while_current(generation, || self.connected())
    }

    pub fn disconnected_as(&self, generation: u64, reason: Option<&str>) -> bool {
        self.while_current(generation, || self.disconnected(reason))
    }

    pub fn connect_failed_as(&self, generation: u64, message: &str) -> bool {
        self.while_current(generation, || self.connect_failed(message))
    }

    pub fn set_status_as(&self, generation: u64, status: ConnectionStatus) -> bool {
        self.while_current(generation, || self.set_status(status))
    }

    pub fn deliver_as(&self, generation: u64, event: &str, data: &Value) -> bool {
        self.while_current(generation, || self.deliver(event, data))
    }

    fn while_current(&self, generation: u64, f: impl FnOnce()) -> bool {
        let current = self.inner.generation.lock();
        if current.get() != generation {
            trace!(generation, current = current.get(), "ignoring call from an ended connection");
            return false;
        }
        f();
        true
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
