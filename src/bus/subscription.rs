//! Subscriber registry and the acknowledgement wrapper handed to subscribers

use super::orchestrator::Command;
use super::signals::{timestamp_millis, BusSignal, Notifier};
use crate::error::{BusError, BusResult};
use crate::observability::Stats;
use crate::transport::{BrokerChannel, Delivery};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::UnboundedSender;

/// Callback receiving every decoded inbound event
pub type Subscriber = Arc<dyn Fn(Arc<Value>, Arc<InboundMessage>) + Send + Sync>;

/// How a delivery is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acknowledge,
    Reject { requeue: bool },
}

/// A decoded delivery plus its single-shot acknowledge/reject operations
pub struct InboundMessage {
    event: Arc<Value>,
    queue: String,
    routing_key: String,
    redelivered: bool,
    delivery_tag: u64,
    channel: Arc<dyn BrokerChannel>,
    settled: AtomicBool,
    commands: UnboundedSender<Command>,
    stats: Arc<Stats>,
    notifier: Notifier,
}

impl InboundMessage {
    pub(crate) fn new(
        event: Arc<Value>,
        delivery: &Delivery,
        channel: Arc<dyn BrokerChannel>,
        commands: UnboundedSender<Command>,
        stats: Arc<Stats>,
        notifier: Notifier,
    ) -> Self {
        Self {
            event,
            queue: delivery.queue.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
            channel,
            settled: AtomicBool::new(false),
            commands,
            stats,
            notifier,
        }
    }

    pub fn event(&self) -> &Arc<Value> {
        &self.event
    }

    /// Queue the message was consumed from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Routing key the event was published with, i.e. its event id
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Mark the message as processed
    pub fn acknowledge(&self) -> BusResult<()> {
        self.settle(Settlement::Acknowledge)
    }

    /// Mark the message as failed, asking the broker to redeliver it if `requeue`
    pub fn reject(&self, requeue: bool) -> BusResult<()> {
        self.settle(Settlement::Reject { requeue })
    }

    fn settle(&self, outcome: Settlement) -> BusResult<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BusError::AlreadySettled);
        }

        self.commands
            .send(Command::Settle {
                channel: self.channel.clone(),
                delivery_tag: self.delivery_tag,
                outcome,
            })
            .map_err(|_| BusError::Closed)?;

        let timestamp = timestamp_millis();
        match outcome {
            Settlement::Acknowledge => {
                self.stats.record_acknowledged();
                self.notifier.emit(BusSignal::EventAcknowledged {
                    event: self.event.clone(),
                    timestamp,
                });
            }
            Settlement::Reject { requeue } => {
                self.stats.record_rejected(requeue);
                self.notifier.emit(BusSignal::EventNacked {
                    event: Some(self.event.clone()),
                    requeue,
                    timestamp,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("event", &self.event)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}

/// Ordered subscriber list; subscribers are never removed
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber, returning the new count
    pub fn register(&self, subscriber: Subscriber) -> usize {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(subscriber);
        subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Call every subscriber in registration order with the same event and message
    pub fn dispatch(&self, message: &Arc<InboundMessage>) {
        for subscriber in self.snapshot() {
            subscriber(message.event.clone(), message.clone());
        }
    }
}

/// Warning text for a subscriber count at or above its maximum
pub fn consumer_warning(count: usize, max: usize) -> String {
    format!("{count} consumers is greater than or equal to max of {max}")
}
