//! Link lifecycle of one headset.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> Streaming
//!            |            |            |    ^       |
//!            |            |            |    +-------+  (stop stream)
//!            v            v            v            v
//!   ScanTimeout    ConnectionFailure   Disconnecting -> Disconnected
//!   ScanFailure    ConnectionInterrupted
//! ```
//!
//! Failure, timeout, interrupted and disconnected states go back to `Idle` on the
//! next scan request. Transitions not in the table are rejected and leave the
//! state unchanged.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::StateError;

const STATE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Streaming,
    Disconnecting,
    Disconnected,
    ScanTimeout,
    ScanFailure,
    ConnectionFailure,
    ConnectionInterrupted,
}

impl ConnectionState {
    /// States from which a new scan restarts the cycle through `Idle`.
    pub fn is_resting(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::ScanTimeout
                | ConnectionState::ScanFailure
                | ConnectionState::ConnectionFailure
                | ConnectionState::ConnectionInterrupted
        )
    }

    pub fn is_failure(self) -> bool {
        self.is_resting() && self != ConnectionState::Disconnected
    }

    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, to) {
            (Idle, Scanning) => true,
            (Scanning, Connecting | ScanTimeout | ScanFailure) => true,
            (Connecting, Connected | ConnectionFailure | ConnectionInterrupted) => true,
            (Connected, Streaming | Disconnecting | ConnectionInterrupted) => true,
            (Streaming, Disconnecting | Connected | ConnectionInterrupted) => true,
            (Disconnecting, Disconnected) => true,
            (from, Idle) => from.is_resting(),
            _ => false,
        }
    }
}

/// Notification published on every accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl StateChange {
    /// True when this transition ends a streaming session.
    pub fn stops_stream(&self) -> bool {
        self.from == ConnectionState::Streaming && self.to != ConnectionState::Streaming
    }
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    events: broadcast::Sender<StateChange>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            state: ConnectionState::Idle,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Move to `to` if the table allows it and publish the change.
    pub fn transition_to(&mut self, to: ConnectionState) -> Result<StateChange, StateError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!("rejected connection transition {:?} -> {:?}", from, to);
            return Err(StateError::InvalidTransition { from, to });
        }

        self.state = to;
        let change = StateChange { from, to };
        debug!("connection state {:?} -> {:?}", from, to);
        // No subscribers is fine.
        let _ = self.events.send(change);
        Ok(change)
    }

    /// Start scanning, passing through `Idle` first when coming from a resting state.
    pub fn request_scan(&mut self) -> Result<Vec<StateChange>, StateError> {
        let mut changes = Vec::with_capacity(2);
        if self.state.is_resting() {
            changes.push(self.transition_to(ConnectionState::Idle)?);
        }
        changes.push(self.transition_to(ConnectionState::Scanning)?);
        Ok(changes)
    }
}
