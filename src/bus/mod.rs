//! The event bus facade
//!
//! [`EventBus`] is the public handle. Synchronous work (argument checks,
//! counters, backlog append, threshold warnings, subscriber registration)
//! happens on the caller's thread; everything touching the broker is handed
//! to the orchestrator task.
//!
//! ```no_run
//! use busterbunny::{BusConfig, EventBus, SignalKind};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BusConfig::new("localhost", "domain-events");
//! let bus = EventBus::builder(config)
//!     .on(SignalKind::Ready, |_| println!("ready"))
//!     .build()?;
//!
//! bus.raise_event("order.placed", &json!({"order": 42}), |result| {
//!     if let Err(error) = result {
//!         eprintln!("{error}");
//!     }
//! });
//!
//! bus.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub(crate) mod orchestrator;
pub mod publish_queue;
pub mod reconnect;
pub mod signals;
pub mod state;
pub mod subscription;

use crate::config::BusConfig;
use crate::error::{BusError, BusResult, UsageError};
use crate::observability::{Stats, StatsReporter, StatsSnapshot};
use crate::transport::{AmqpBroker, Broker, ClientProperties, PublishOptions};
use codec::EventCodec;
use orchestrator::{BusCore, BusShared, Command};
use publish_queue::{backlog_warning, AfterRaised, PublishQueue, PublishRequest};
use serde::Serialize;
use serde_json::Value;
use signals::{BusSignal, ListenerId, Notifier, SignalKind};
use state::{ConnectionState, StateMachine};
use std::fmt;
use std::sync::Arc;
use subscription::{consumer_warning, InboundMessage, SubscriptionRegistry};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Third positional argument of [`EventBus::raise_events`]
pub enum RaiseArg {
    Options(PublishOptions),
    Callback(AfterRaised),
}

impl RaiseArg {
    pub fn callback<F>(after_raised: F) -> Self
    where
        F: FnOnce(BusResult<()>) + Send + 'static,
    {
        RaiseArg::Callback(Box::new(after_raised))
    }
}

impl From<PublishOptions> for RaiseArg {
    fn from(options: PublishOptions) -> Self {
        RaiseArg::Options(options)
    }
}

impl fmt::Debug for RaiseArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaiseArg::Options(options) => f.debug_tuple("Options").field(options).finish(),
            RaiseArg::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Work out which argument is the completion callback
pub fn resolve_raise_args(
    third: Option<RaiseArg>,
    after_raised: Option<AfterRaised>,
) -> Result<(Option<PublishOptions>, AfterRaised), UsageError> {
    match (third, after_raised) {
        (Some(RaiseArg::Callback(_)), Some(_)) => Err(UsageError::AmbiguousCallback),
        (Some(RaiseArg::Callback(callback)), None) => Ok((None, callback)),
        (Some(RaiseArg::Options(options)), Some(callback)) => Ok((Some(options), callback)),
        (None, Some(callback)) => Ok((None, callback)),
        (_, None) => Err(UsageError::MissingCallback),
    }
}

/// Configures and starts an [`EventBus`]
pub struct EventBusBuilder {
    config: BusConfig,
    broker: Option<Arc<dyn Broker>>,
    properties: Option<ClientProperties>,
    notifier: Notifier,
}

impl EventBusBuilder {
    /// Broker client to connect with; defaults to [`AmqpBroker`]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Override the detected client identification
    pub fn client_properties(mut self, properties: ClientProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Attach a listener before the first connect attempt starts
    pub fn on<F>(self, kind: SignalKind, listener: F) -> Self
    where
        F: Fn(&BusSignal) + Send + Sync + 'static,
    {
        self.notifier.on(kind, listener);
        self
    }

    pub fn on_any<F>(self, listener: F) -> Self
    where
        F: Fn(&BusSignal) + Send + Sync + 'static,
    {
        self.notifier.on_any(listener);
        self
    }

    /// Validate the configuration and start connecting.
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> BusResult<EventBus> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let properties = self
            .properties
            .unwrap_or_else(|| ClientProperties::detect(self.config.application_name.as_deref()));
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(AmqpBroker::new()) as Arc<dyn Broker>);

        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Stats::new());
        let shared = Arc::new(BusShared {
            url: self.config.cluster.url(),
            queue: PublishQueue::new(self.config.thresholds.max_raised_events),
            subscribers: SubscriptionRegistry::new(),
            config: self.config,
            broker,
            properties,
            stats: stats.clone(),
            notifier: self.notifier.clone(),
            commands: tx,
        });

        info!(
            url = %shared.config.cluster.redacted_url(),
            application = %shared.properties.application,
            "Starting event bus"
        );

        let machine = StateMachine::new();
        let state = machine.watch();
        let core = runtime.spawn(BusCore::new(shared.clone(), rx, machine).run());
        let reporter = shared
            .config
            .stats_period()
            .map(|period| StatsReporter::spawn(period, stats, self.notifier));

        Ok(EventBus {
            shared,
            state,
            runtime,
            core,
            reporter,
        })
    }
}

/// Client-side facade over one broker connection
pub struct EventBus {
    shared: Arc<BusShared>,
    state: watch::Receiver<ConnectionState>,
    runtime: Handle,
    core: JoinHandle<()>,
    reporter: Option<JoinHandle<()>>,
}

impl EventBus {
    pub fn builder(config: BusConfig) -> EventBusBuilder {
        EventBusBuilder {
            config,
            broker: None,
            properties: None,
            notifier: Notifier::new(),
        }
    }

    /// Queue an event for publishing to the configured exchange with `event_id` as routing key.
    ///
    /// `third` is either publish options or the completion callback. The
    /// callback must be given exactly once, otherwise a [`UsageError`] is
    /// returned and nothing is queued. Every other failure, including an
    /// empty or missing `event_id`, is reported through the callback.
    pub fn raise_events<'a, E>(
        &self,
        event_id: impl Into<Option<&'a str>>,
        event: &E,
        third: Option<RaiseArg>,
        after_raised: Option<AfterRaised>,
    ) -> Result<(), UsageError>
    where
        E: Serialize + ?Sized,
    {
        let (options, after_raised) = resolve_raise_args(third, after_raised)?;
        self.enqueue_event(event_id.into(), event, options, after_raised);
        Ok(())
    }

    /// Queue an event with default publish options
    pub fn raise_event<E, F>(&self, event_id: &str, event: &E, after_raised: F)
    where
        E: Serialize + ?Sized,
        F: FnOnce(BusResult<()>) + Send + 'static,
    {
        self.enqueue_event(Some(event_id), event, None, Box::new(after_raised));
    }

    /// Queue an event and wait until it is published or fails
    pub async fn publish<E>(
        &self,
        event_id: &str,
        event: &E,
        options: Option<PublishOptions>,
    ) -> BusResult<()>
    where
        E: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue_event(
            Some(event_id),
            event,
            options,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(Err(BusError::Closed))
    }

    fn enqueue_event<E>(
        &self,
        event_id: Option<&str>,
        event: &E,
        options: Option<PublishOptions>,
        after_raised: AfterRaised,
    ) where
        E: Serialize + ?Sized,
    {
        let Some(event_id) = event_id.filter(|id| !id.is_empty()) else {
            self.complete_later(after_raised, Err(BusError::InvalidEventId));
            return;
        };

        let payload = match EventCodec::encode_event(event) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(event_id = %event_id, error = %error, "Event could not be encoded");
                self.complete_later(after_raised, Err(error.into()));
                return;
            }
        };

        self.shared.stats.record_event_queued();
        let request = PublishRequest::new(
            self.shared.config.exchange.as_str(),
            event_id,
            payload,
            options,
            after_raised,
        );

        match self.shared.queue.enqueue(request) {
            Ok(outcome) => {
                if outcome.crossed_threshold {
                    let message = backlog_warning(outcome.depth, self.shared.queue.max_depth());
                    warn!(depth = outcome.depth, "{message}");
                    self.shared
                        .notifier
                        .emit(BusSignal::WarningRaised { message });
                }
                let _ = self.shared.commands.send(Command::DrainRequested);
            }
            Err(request) => {
                self.shared.stats.record_event_dequeued();
                self.runtime
                    .spawn(async move { request.complete(Err(BusError::Closed)) });
            }
        }
    }

    fn complete_later(&self, after_raised: AfterRaised, result: BusResult<()>) {
        self.runtime.spawn(async move { after_raised(result) });
    }

    /// Register a subscriber for events consumed from the configured queues.
    ///
    /// The first subscriber opens the consumer channel. Subscribers must
    /// settle every message exactly once via [`InboundMessage::acknowledge`]
    /// or [`InboundMessage::reject`].
    pub fn subscribe<F>(&self, on_next: F) -> Result<(), UsageError>
    where
        F: Fn(Arc<Value>, Arc<InboundMessage>) + Send + Sync + 'static,
    {
        if self.shared.config.queues.is_empty() {
            return Err(UsageError::NoQueueConfigured);
        }

        let count = self.shared.subscribers.register(Arc::new(on_next));
        self.shared.stats.record_subscriber();

        let max = self.shared.config.thresholds.max_consumers;
        if count >= max {
            let message = consumer_warning(count, max);
            warn!(subscribers = count, "{message}");
            self.shared
                .notifier
                .emit(BusSignal::WarningRaised { message });
        }

        if count == 1 {
            let _ = self.shared.commands.send(Command::EstablishConsumer);
        }
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    /// Always ends with a `Disconnected` signal, including on repeat calls.
    pub async fn disconnect(&self) {
        let (done, finished) = oneshot::channel();
        if self.shared.commands.send(Command::Disconnect { done }).is_ok()
            && finished.await.is_ok()
        {
            return;
        }

        // Orchestrator already stopped
        self.shared.notifier.emit(BusSignal::Disconnecting);
        self.shared.notifier.emit(BusSignal::Disconnected);
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The broker URL this bus connects to, credentials included
    pub fn get_url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Attach a listener for one signal kind.
    ///
    /// Signals are delivered from the orchestrator task, except
    /// [`SignalKind::WarningRaised`], which runs on the thread calling
    /// [`raise_events`](Self::raise_events) or [`subscribe`](Self::subscribe)
    /// before that call returns. On a multi-thread runtime a warning listener
    /// can therefore run concurrently with listeners for other signals.
    pub fn on<F>(&self, kind: SignalKind, listener: F) -> ListenerId
    where
        F: Fn(&BusSignal) + Send + Sync + 'static,
    {
        self.shared.notifier.on(kind, listener)
    }

    /// Attach a listener for every signal kind; threading as for [`on`](Self::on)
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BusSignal) + Send + Sync + 'static,
    {
        self.shared.notifier.on_any(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.notifier.off(id)
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.core.abort();
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
    }
}
