//! Events published by the controller.

use crate::error::LinkError;
use crate::message::MessageKind;
use crate::state::TowerState;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    LinkLost,
    HeartbeatTimeout,
    ResponseTimeout,
    ConnectFailed(LinkError),
    /// A write reported the link as down
    WriteFailed(LinkError),
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TowerEvent {
    Connected,
    Disconnected(DisconnectReason),
    CalibrationComplete,
    /// Beam counter changed to a non-zero value
    SkullDrop(u16),
    Battery { millivolts: u16, percent: u8 },
    StateChanged(TowerState),
    AvailabilityChanged(bool),
    /// Any inbound frame that is neither a state report nor a battery reading
    Message { kind: MessageKind, lines: Vec<String> },
}

/// Broadcast fan-out. Each subscriber gets its own receiver; a subscriber that
/// falls behind by more than the channel capacity sees `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TowerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: TowerEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TowerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
