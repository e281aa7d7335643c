//! Connection lifecycle state machine
//!
//! Transitions are typed and validated here. The orchestrator applies them and
//! decides separately which public signals to emit, so internal bookkeeping
//! never travels through the listener registry.

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Lifecycle state of one bus instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Initial state, and terminal once a disconnect completes
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Connection established
    Connected,
    /// Waiting out the retry delay before the next connect attempt
    Reconnecting,
    /// Disconnect requested; reconnection suppressed
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Events that move the lifecycle between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connect,
    ConnectSucceeded,
    ConnectFailed,
    ConnectionLost,
    Disconnect,
    Closed,
    /// Retry policy exhausted
    Abandon,
}

/// Pure transition table. `None` means the transition is not valid from `current`.
pub fn next_state(current: ConnectionState, transition: Transition) -> Option<ConnectionState> {
    use ConnectionState::*;

    match (current, transition) {
        (Disconnected | Reconnecting, Transition::Connect) => Some(Connecting),
        (Connecting, Transition::ConnectSucceeded) => Some(Connected),
        (Connecting, Transition::ConnectFailed) => Some(Reconnecting),
        (Connected, Transition::ConnectionLost) => Some(Reconnecting),
        (_, Transition::Disconnect) => Some(Disconnecting),
        (Disconnecting, Transition::Closed) => Some(Disconnected),
        (Reconnecting, Transition::Abandon) => Some(Disconnected),
        _ => None,
    }
}

/// Log a state change at a level matching its severity
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Broker connection established");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting) => {
            warn!("Broker connection lost");
        }
        (ConnectionState::Connecting, ConnectionState::Reconnecting) => {
            warn!("Broker connect attempt failed");
        }
        (ConnectionState::Reconnecting, ConnectionState::Disconnected) => {
            error!("Giving up on broker connection");
        }
        _ => {
            info!(from = %from, to = %to, "Connection state changed");
        }
    }
}

/// Owns the current state and publishes every change to watchers
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply a transition, returning the new state, or `None` if it was rejected
    pub fn apply(&self, transition: Transition) -> Option<ConnectionState> {
        let from = self.current();
        match next_state(from, transition) {
            Some(to) => {
                self.tx.send_replace(to);
                log_state_transition(from, to);
                Some(to)
            }
            None => {
                warn!(state = %from, transition = ?transition, "Ignoring invalid state transition");
                None
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }
}
