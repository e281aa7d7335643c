//! In-memory broker and signal recorder
//!
//! [`MockBroker`] implements the broker boundary without a network. Tests
//! script failures up front (`fail_next_connects`, `fail_publishes_with`, ...)
//! and inspect what the bus did afterwards (`published`, `acks`, `nacks`, ...).

use crate::bus::signals::{BusSignal, SignalKind};
use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ClientProperties,
    Delivery, DeliveryStream, ErrorHandler, PublishOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A message the bus published through the mock
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub options: PublishOptions,
}

impl PublishedMessage {
    /// Payload parsed as JSON, `Value::Null` if it is not valid JSON
    pub fn event(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

/// A negative acknowledgement observed by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRecord {
    pub delivery_tag: u64,
    pub multiple: bool,
    pub requeue: bool,
}

#[derive(Default)]
struct MockState {
    connect_attempts: usize,
    urls: Vec<String>,
    properties: Vec<ClientProperties>,
    connect_failures: VecDeque<String>,
    hang_connects: usize,
    /// Hung connect attempts whose future is still alive
    hanging_connects: usize,
    fail_channel_creation: Option<String>,
    publish_failure: Option<String>,
    close_failure: Option<String>,
    connections: Vec<Arc<MockConnection>>,
    channels_created: usize,
    published: Vec<PublishedMessage>,
    acks: Vec<u64>,
    nacks: Vec<NackRecord>,
    declared_queues: Vec<String>,
    prefetch: Vec<u16>,
    consumers: HashMap<String, Vec<UnboundedSender<BrokerResult<Delivery>>>>,
    next_delivery_tag: u64,
}

/// Scriptable in-memory broker
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` connect attempts with `reason`
    pub fn fail_next_connects(&self, count: usize, reason: &str) {
        let mut state = self.lock();
        state
            .connect_failures
            .extend(std::iter::repeat(reason.to_string()).take(count));
    }

    /// Make the next connect attempt never complete
    pub fn hang_next_connect(&self) {
        self.lock().hang_connects += 1;
    }

    /// Fail every `create_channel` call with `reason`
    pub fn fail_channel_creation(&self, reason: &str) {
        self.lock().fail_channel_creation = Some(reason.to_string());
    }

    /// Fail every publish with `reason` until [`clear_publish_failure`](Self::clear_publish_failure)
    pub fn fail_publishes_with(&self, reason: &str) {
        self.lock().publish_failure = Some(reason.to_string());
    }

    pub fn clear_publish_failure(&self) {
        self.lock().publish_failure = None;
    }

    /// Fail every connection close with `reason`
    pub fn fail_close_with(&self, reason: &str) {
        self.lock().close_failure = Some(reason.to_string());
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Connect attempts started by [`hang_next_connect`](Self::hang_next_connect) that nobody has dropped yet
    pub fn hanging_connects(&self) -> usize {
        self.lock().hanging_connects
    }

    pub fn urls(&self) -> Vec<String> {
        self.lock().urls.clone()
    }

    pub fn last_client_properties(&self) -> Option<ClientProperties> {
        self.lock().properties.last().cloned()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.lock().connections.last().cloned()
    }

    pub fn channels_created(&self) -> usize {
        self.lock().channels_created
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Routing keys of published messages, in publish order
    pub fn published_ids(&self) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .map(|message| message.routing_key.clone())
            .collect()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub fn nacks(&self) -> Vec<NackRecord> {
        self.lock().nacks.clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.lock().declared_queues.clone()
    }

    pub fn prefetch_calls(&self) -> Vec<u16> {
        self.lock().prefetch.clone()
    }

    /// Number of live consumers on `queue`
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .get(queue)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    /// Deliver `payload` to the newest live consumer of `queue`, returning its delivery tag
    pub fn deliver(&self, queue: &str, payload: impl Into<Bytes>) -> Option<u64> {
        let mut state = self.lock();
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        let sender = state
            .consumers
            .get(queue)?
            .iter()
            .rev()
            .find(|sender| !sender.is_closed())?
            .clone();

        let delivery = Delivery {
            delivery_tag,
            queue: queue.to_string(),
            routing_key: queue.to_string(),
            redelivered: false,
            payload: payload.into(),
        };
        sender.unbounded_send(Ok(delivery)).ok()?;
        Some(delivery_tag)
    }

    /// Fire the error handlers of the newest connection and end its consumers
    pub fn cause_connection_error(&self, reason: &str) {
        let connection = {
            let mut state = self.lock();
            state.consumers.clear();
            state.connections.last().cloned()
        };
        if let Some(connection) = connection {
            connection.fail(BrokerError::ConnectionLost(reason.to_string()));
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        url: &str,
        properties: &ClientProperties,
    ) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let outcome = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            state.urls.push(url.to_string());
            state.properties.push(properties.clone());

            if state.hang_connects > 0 {
                state.hang_connects -= 1;
                state.hanging_connects += 1;
                None
            } else if let Some(reason) = state.connect_failures.pop_front() {
                Some(Err(BrokerError::ConnectionFailed(reason)))
            } else {
                let connection = Arc::new(MockConnection {
                    broker: self.clone(),
                    closed: AtomicBool::new(false),
                    handlers: Mutex::new(Vec::new()),
                });
                state.connections.push(connection.clone());
                Some(Ok(connection as Arc<dyn BrokerConnection>))
            }
        };

        match outcome {
            Some(result) => result,
            None => {
                let _hung = HungConnect(self.clone());
                futures::future::pending().await
            }
        }
    }
}

/// Releases a hung connect's slot when its future is dropped
struct HungConnect(MockBroker);

impl Drop for HungConnect {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.hanging_connects = state.hanging_connects.saturating_sub(1);
    }
}

/// Connection handed out by [`MockBroker`]
pub struct MockConnection {
    broker: MockBroker,
    closed: AtomicBool,
    handlers: Mutex<Vec<ErrorHandler>>,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn error_handler_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn fail(&self, error: BrokerError) {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handler in handlers.iter_mut() {
            handler(error.clone());
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        if let Some(reason) = &state.fail_channel_creation {
            return Err(BrokerError::Channel(reason.clone()));
        }
        state.channels_created += 1;
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
        }))
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Some(reason) = &self.broker.lock().close_failure {
            return Err(BrokerError::Close(reason.clone()));
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MockChannel {
    broker: MockBroker,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn prefetch(&self, count: u16) -> BrokerResult<()> {
        self.broker.lock().prefetch.push(count);
        Ok(())
    }

    async fn assert_queue(&self, queue: &str) -> BrokerResult<()> {
        self.broker.lock().declared_queues.push(queue.to_string());
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        let (tx, rx) = unbounded();
        self.broker
            .lock()
            .consumers
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.broker.lock().acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()> {
        self.broker.lock().nacks.push(NackRecord {
            delivery_tag,
            multiple,
            requeue,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        if let Some(reason) = &state.publish_failure {
            return Err(BrokerError::Publish(reason.clone()));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: Bytes::copy_from_slice(payload),
            options: options.clone(),
        });
        Ok(())
    }
}

/// Records every signal a bus emits
#[derive(Clone, Default)]
pub struct SignalRecorder {
    signals: Arc<Mutex<Vec<BusSignal>>>,
}

impl SignalRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BusSignal>> {
        self.signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Listener to attach with `on_any`
    pub fn listener(&self) -> impl Fn(&BusSignal) + Send + Sync + 'static {
        let signals = self.signals.clone();
        move |signal: &BusSignal| {
            signals
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(signal.clone())
        }
    }

    pub fn signals(&self) -> Vec<BusSignal> {
        self.lock().clone()
    }

    pub fn kinds(&self) -> Vec<SignalKind> {
        self.lock().iter().map(BusSignal::kind).collect()
    }

    pub fn count(&self, kind: SignalKind) -> usize {
        self.lock().iter().filter(|s| s.kind() == kind).count()
    }

    /// Messages of every `WarningRaised` signal, in order
    pub fn warnings(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|signal| match signal {
                BusSignal::WarningRaised { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Poll until `count` signals of `kind` were seen or `timeout` elapses
    pub async fn wait_for(&self, kind: SignalKind, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count(kind) >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
