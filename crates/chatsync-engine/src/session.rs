use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use chatsync_types::SessionIdentity;

/// Holder of the signed-in user. The engine follows it through a receiver.
#[derive(Debug, Clone)]
pub struct Session {
    tx: Arc<watch::Sender<Option<SessionIdentity>>>,
}

impl Session {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn login(&self, identity: SessionIdentity) {
        info!(user_id = %identity.user_id, "session started");
        self.tx.send_replace(Some(identity));
    }

    pub fn logout(&self) {
        if self.tx.send_replace(None).is_some() {
            info!("session ended");
        }
    }

    pub fn current(&self) -> Option<SessionIdentity> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SessionIdentity>> {
        self.tx.subscribe()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
