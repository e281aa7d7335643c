//! Per-bus operational counters
//!
//! Counters live for the lifetime of one bus instance and are only reset by
//! building a new one. Readers get [`StatsSnapshot`] copies.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct Stats {
    queued_events_to_raise: AtomicU64,
    subscribers: AtomicU64,
    reconnects: AtomicU64,
    messages_acknowledged: AtomicU64,
    messages_rejected: AtomicU64,
    messages_rejected_with_retry: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub queued_events_to_raise: u64,
    pub subscribers: u64,
    pub reconnects: u64,
    pub messages_acknowledged: u64,
    pub messages_rejected: u64,
    pub messages_rejected_with_retry: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event_queued(&self) {
        self.queued_events_to_raise.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo or settle one queued event; never goes below zero
    pub fn record_event_dequeued(&self) {
        let _ = self.queued_events_to_raise.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| Some(n.saturating_sub(1)),
        );
    }

    /// Returns the subscriber count after the increment
    pub fn record_subscriber(&self) -> u64 {
        self.subscribers.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledged(&self) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, requeue: bool) {
        if requeue {
            self.messages_rejected_with_retry
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued_events_to_raise: self.queued_events_to_raise.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            messages_rejected_with_retry: self
                .messages_rejected_with_retry
                .load(Ordering::Relaxed),
        }
    }
}
