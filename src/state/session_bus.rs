use tokio::sync::broadcast;

use crate::types::SessionSignal;

const SIGNAL_CAPACITY: usize = 16;

/// Process-wide channel for session lifecycle signals.
#[derive(Clone)]
pub struct SessionBus {
    tx: broadcast::Sender<SessionSignal>,
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.tx.subscribe()
    }

    /// Having no listeners is not an error.
    pub fn emit(&self, signal: SessionSignal) {
        tracing::debug!(?signal, "session signal");
        let _ = self.tx.send(signal);
    }
}
