//! Notifications for the UI layer.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanEvent {
    PlayerListChanged,
    DiscoveryListChanged,
    /// The session ended without us asking for it (host lost, refused).
    Disconnected { reason: String },
}

/// Fan-out of [`LanEvent`]s to any number of subscribers.
///
/// Subscribers that dropped their receiver are pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<LanEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<LanEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: LanEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
