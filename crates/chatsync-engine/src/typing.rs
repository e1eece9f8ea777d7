use std::time::Duration;

use tokio::time::Instant;

use chatsync_types::Scope;
use chatsync_types::events::TypingPayload;

/// A `typing` event the engine should emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub scope: Scope,
    pub active: bool,
}

impl TypingSignal {
    fn start(scope: Scope) -> Self {
        Self { scope, active: true }
    }

    fn stop(scope: Scope) -> Self {
        Self { scope, active: false }
    }
}

#[derive(Debug, Clone)]
struct Burst {
    scope: Scope,
    deadline: Instant,
}

/// A peer with an outstanding `active=true` signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingPeer {
    pub user_id: String,
    pub display_name: String,
    pub scope: Scope,
}

/// Debounced outbound typing state plus the set of peers currently typing.
///
/// Outbound: one `active=true` per burst of keystrokes and exactly one
/// `active=false` when the burst ends (idle deadline, send, or scope switch).
/// The deadline is plain data; the caller sleeps until [`Self::deadline`] and
/// then calls [`Self::poll_expired`].
///
/// Inbound: peers stay listed until they send `active=false` or leave.
#[derive(Debug, Clone)]
pub struct TypingCoordinator {
    local_user: String,
    idle: Duration,
    burst: Option<Burst>,
    peers: Vec<TypingPeer>,
}

impl TypingCoordinator {
    pub fn new(local_user: impl Into<String>, idle: Duration) -> Self {
        Self {
            local_user: local_user.into(),
            idle,
            burst: None,
            peers: Vec::new(),
        }
    }

    // -- Outbound --

    /// Register a local keystroke in `scope`, returning the signals to emit.
    pub fn keystroke(&mut self, scope: &Scope, now: Instant) -> Vec<TypingSignal> {
        let deadline = now + self.idle;
        if let Some(burst) = self.burst.as_mut() {
            if burst.scope == *scope {
                burst.deadline = deadline;
                return Vec::new();
            }
        }

        // New burst, possibly ending one in another scope first
        let mut signals = Vec::with_capacity(2);
        signals.extend(self.stop());
        self.burst = Some(Burst {
            scope: scope.clone(),
            deadline,
        });
        signals.push(TypingSignal::start(scope.clone()));
        signals
    }

    /// End the burst if its idle deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<TypingSignal> {
        let expired = self.burst.as_ref().is_some_and(|b| b.deadline <= now);
        if expired { self.stop() } else { None }
    }

    /// End the burst now (the message was sent).
    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.burst.take().map(|burst| TypingSignal::stop(burst.scope))
    }

    /// Drop the burst without announcing it. Used when outbound is frozen.
    pub fn cancel(&mut self) -> bool {
        self.burst.take().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.burst.as_ref().map(|b| b.deadline)
    }

    pub fn is_typing(&self) -> bool {
        self.burst.is_some()
    }

    // -- Inbound --

    /// Apply a peer's typing signal. Returns whether the set changed.
    pub fn on_signal(&mut self, signal: TypingPayload) -> bool {
        if signal.user_id.is_empty() || signal.user_id == self.local_user {
            return false;
        }

        let scope = match signal.receiver_id.as_deref().filter(|r| !r.is_empty()) {
            None => Scope::Global,
            Some(receiver) if receiver == self.local_user => Scope::direct(signal.user_id.clone()),
            // Typing at someone else: not ours to show
            Some(_) => return self.drop_peer(&signal.user_id),
        };

        if !signal.is_typing {
            return self.drop_peer(&signal.user_id);
        }

        let peer = TypingPeer {
            display_name: if signal.user_name.is_empty() {
                signal.user_id.clone()
            } else {
                signal.user_name
            },
            user_id: signal.user_id,
            scope,
        };
        match self.peers.iter_mut().find(|p| p.user_id == peer.user_id) {
            Some(existing) if *existing == peer => false,
            Some(existing) => {
                *existing = peer;
                true
            }
            None => {
                self.peers.push(peer);
                true
            }
        }
    }

    pub fn drop_peer(&mut self, user_id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.user_id != user_id);
        self.peers.len() != before
    }

    pub fn clear_peers(&mut self) -> bool {
        let changed = !self.peers.is_empty();
        self.peers.clear();
        changed
    }

    pub fn peers(&self) -> &[TypingPeer] {
        &self.peers
    }

    /// Display names of peers typing in `scope`, in the order they started.
    pub fn names_in(&self, scope: &Scope) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.scope == *scope)
            .map(|p| p.display_name.clone())
            .collect()
    }
}
