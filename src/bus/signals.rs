//! Public signal vocabulary and the listener registry that delivers it
//!
//! Every bus owns its own [`Notifier`]; listeners attached to one instance
//! never observe another.

use crate::observability::StatsSnapshot;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Signals emitted to external listeners
#[derive(Debug, Clone, PartialEq)]
pub enum BusSignal {
    Ready,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
    WarningRaised {
        message: String,
    },
    Stats(StatsSnapshot),
    EventAcknowledged {
        event: Arc<Value>,
        timestamp: i64,
    },
    /// `event` is `None` when the payload could not be decoded
    EventNacked {
        event: Option<Arc<Value>>,
        requeue: bool,
        timestamp: i64,
    },
    /// Unrecoverable failure; the bus has stopped
    Error {
        message: String,
    },
}

/// Discriminant of [`BusSignal`], used to attach listeners to one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Ready,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
    WarningRaised,
    Stats,
    EventAcknowledged,
    EventNacked,
    Error,
}

impl BusSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            BusSignal::Ready => SignalKind::Ready,
            BusSignal::Connecting => SignalKind::Connecting,
            BusSignal::Connected => SignalKind::Connected,
            BusSignal::Reconnecting => SignalKind::Reconnecting,
            BusSignal::Disconnecting => SignalKind::Disconnecting,
            BusSignal::Disconnected => SignalKind::Disconnected,
            BusSignal::WarningRaised { .. } => SignalKind::WarningRaised,
            BusSignal::Stats(_) => SignalKind::Stats,
            BusSignal::EventAcknowledged { .. } => SignalKind::EventAcknowledged,
            BusSignal::EventNacked { .. } => SignalKind::EventNacked,
            BusSignal::Error { .. } => SignalKind::Error,
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub type Listener = Arc<dyn Fn(&BusSignal) + Send + Sync>;

/// Handle returned when attaching a listener, used to detach it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    kind: Option<SignalKind>,
    id: ListenerId,
    listener: Listener,
}

/// Cloneable listener registry; clones share the same listeners
#[derive(Clone, Default)]
pub struct Notifier {
    listeners: Arc<RwLock<Vec<Registration>>>,
    next_id: Arc<AtomicU64>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, kind: Option<SignalKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Registration { kind, id, listener });
        id
    }

    /// Attach a listener for one signal kind
    pub fn on<F>(&self, kind: SignalKind, listener: F) -> ListenerId
    where
        F: Fn(&BusSignal) + Send + Sync + 'static,
    {
        self.attach(Some(kind), Arc::new(listener))
    }

    /// Attach a listener for every signal
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BusSignal) + Send + Sync + 'static,
    {
        self.attach(None, Arc::new(listener))
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Listeners that would receive a signal of `kind`, wildcard listeners included
    pub fn listener_count(&self, kind: SignalKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|registration| registration.kind.map_or(true, |k| k == kind))
            .count()
    }

    /// Deliver a signal to matching listeners in attachment order
    pub fn emit(&self, signal: BusSignal) {
        let kind = signal.kind();
        // Snapshot so listeners may attach or detach while being called
        let matching: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|registration| registration.kind.map_or(true, |k| k == kind))
            .map(|registration| registration.listener.clone())
            .collect();

        for listener in matching {
            listener(&signal);
        }
    }
}
