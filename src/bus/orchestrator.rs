//! Orchestrator task
//!
//! One `BusCore` per bus owns the connection and both channels. It consumes a
//! single command queue, so every transition, drain pass, delivery dispatch
//! and settlement runs to completion before the next command is looked at.
//! Suspension only happens while awaiting the broker.

use super::codec::EventCodec;
use super::publish_queue::PublishQueue;
use super::reconnect::{should_attempt_reconnection, ReconnectionDecision};
use super::signals::{timestamp_millis, BusSignal, Notifier};
use super::state::{ConnectionState, StateMachine, Transition};
use super::subscription::{InboundMessage, Settlement, SubscriptionRegistry};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::observability::{consume_span, publish_span, Stats, StatsReporter};
use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ClientProperties,
    Delivery, DeliveryStream,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Everything the orchestrator consumes
pub(crate) enum Command {
    /// The backlog grew; publish what can be published
    DrainRequested,
    /// The first subscriber registered
    EstablishConsumer,
    Deliver {
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
        delivery: Delivery,
    },
    Settle {
        channel: Arc<dyn BrokerChannel>,
        delivery_tag: u64,
        outcome: Settlement,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    ConnectOutcome {
        attempt: u64,
        result: BrokerResult<Arc<dyn BrokerConnection>>,
    },
    ConnectionError {
        generation: u64,
        error: BrokerError,
    },
    RetryConnect {
        attempt: u64,
    },
}

/// State shared between the public handle and the orchestrator
pub(crate) struct BusShared {
    pub config: BusConfig,
    pub url: String,
    pub broker: Arc<dyn Broker>,
    pub properties: ClientProperties,
    pub stats: Arc<Stats>,
    pub notifier: Notifier,
    pub queue: PublishQueue,
    pub subscribers: SubscriptionRegistry,
    pub commands: mpsc::UnboundedSender<Command>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct BusCore {
    shared: Arc<BusShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: StateMachine,
    connection: Option<Arc<dyn BrokerConnection>>,
    publish_channel: Option<Arc<dyn BrokerChannel>>,
    consumer_channel: Option<Arc<dyn BrokerChannel>>,
    consumer_tasks: Vec<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    /// Bumped on every established connection; stale errors and deliveries are dropped
    generation: u64,
    /// Identifies the latest connect attempt; stale outcomes are dropped
    connect_attempt: u64,
    /// Consecutive failures since the last successful connect
    failed_attempts: u32,
    disconnecting: bool,
}

impl BusCore {
    pub fn new(
        shared: Arc<BusShared>,
        commands: mpsc::UnboundedReceiver<Command>,
        state: StateMachine,
    ) -> Self {
        Self {
            shared,
            commands,
            state,
            connection: None,
            publish_channel: None,
            consumer_channel: None,
            consumer_tasks: Vec::new(),
            retry_timer: None,
            connect_task: None,
            generation: 0,
            connect_attempt: 0,
            failed_attempts: 0,
            disconnecting: false,
        }
    }

    pub async fn run(mut self) {
        self.begin_connect();

        while let Some(command) = self.commands.recv().await {
            if self.handle(command).await == Flow::Stop {
                break;
            }
        }

        self.abort_tasks();
        debug!("Event bus orchestrator stopped");
    }

    fn emit(&self, signal: BusSignal) {
        self.shared.notifier.emit(signal);
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::DrainRequested => {
                self.drain().await;
                Flow::Continue
            }
            Command::EstablishConsumer => match self.establish_consumer().await {
                Ok(()) => Flow::Continue,
                Err(error) => self.fail_fatally(error).await,
            },
            Command::Deliver {
                generation,
                channel,
                delivery,
            } => {
                if generation == self.generation {
                    self.dispatch(channel, delivery).await;
                } else {
                    debug!(
                        delivery_tag = delivery.delivery_tag,
                        "Dropping delivery from a previous connection"
                    );
                }
                Flow::Continue
            }
            Command::Settle {
                channel,
                delivery_tag,
                outcome,
            } => {
                Self::settle(channel, delivery_tag, outcome).await;
                Flow::Continue
            }
            Command::Disconnect { done } => {
                self.disconnect().await;
                let _ = done.send(());
                Flow::Continue
            }
            Command::ConnectOutcome { attempt, result } => {
                self.on_connect_outcome(attempt, result).await
            }
            Command::ConnectionError { generation, error } => {
                self.on_connection_error(generation, error);
                Flow::Continue
            }
            Command::RetryConnect { attempt } => {
                if attempt == self.connect_attempt
                    && !self.disconnecting
                    && self.state.current() == ConnectionState::Reconnecting
                {
                    self.begin_connect();
                }
                Flow::Continue
            }
        }
    }

    fn begin_connect(&mut self) {
        if self.disconnecting || self.state.apply(Transition::Connect).is_none() {
            return;
        }
        self.emit(BusSignal::Connecting);

        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        let broker = self.shared.broker.clone();
        let url = self.shared.url.clone();
        let properties = self.shared.properties.clone();
        let commands = self.shared.commands.clone();

        info!(url = %self.shared.config.cluster.redacted_url(), attempt, "Connecting to broker");
        self.connect_task = Some(tokio::spawn(async move {
            let result = broker.connect(&url, &properties).await;
            let _ = commands.send(Command::ConnectOutcome { attempt, result });
        }));
    }

    async fn on_connect_outcome(
        &mut self,
        attempt: u64,
        result: BrokerResult<Arc<dyn BrokerConnection>>,
    ) -> Flow {
        let current = attempt == self.connect_attempt
            && !self.disconnecting
            && self.state.current() == ConnectionState::Connecting;

        if !current {
            if let Ok(connection) = result {
                debug!(attempt, "Closing connection that completed after it was abandoned");
                if let Err(error) = connection.close().await {
                    warn!(error = %error, "Failed to close abandoned connection");
                }
            }
            return Flow::Continue;
        }

        match result {
            Ok(connection) => self.on_connected(connection).await,
            Err(error) => {
                warn!(error = %error, attempt, "Broker connect attempt failed");
                self.state.apply(Transition::ConnectFailed);
                self.schedule_reconnect();
                Flow::Continue
            }
        }
    }

    async fn on_connected(&mut self, connection: Arc<dyn BrokerConnection>) -> Flow {
        self.generation += 1;
        let generation = self.generation;
        let commands = self.shared.commands.clone();
        connection.on_error(Box::new(move |error| {
            let _ = commands.send(Command::ConnectionError { generation, error });
        }));

        self.connection = Some(connection.clone());
        self.state.apply(Transition::ConnectSucceeded);
        self.failed_attempts = 0;
        self.emit(BusSignal::Connected);

        match connection.create_channel().await {
            Ok(channel) => {
                debug!(generation, "Publishing channel established");
                self.publish_channel = Some(channel);
            }
            Err(error) => return self.fail_fatally(BusError::ChannelCreation(error)).await,
        }

        self.drain().await;

        if !self.shared.subscribers.is_empty() {
            if let Err(error) = self.establish_consumer().await {
                return self.fail_fatally(error).await;
            }
        }

        info!(generation, "Event bus ready");
        self.emit(BusSignal::Ready);
        Flow::Continue
    }

    fn on_connection_error(&mut self, generation: u64, error: BrokerError) {
        if generation != self.generation
            || self.disconnecting
            || self.state.current() != ConnectionState::Connected
        {
            debug!(generation, error = %error, "Ignoring error from inactive connection");
            return;
        }

        warn!(error = %error, "Broker connection error");
        self.drop_connection();
        self.state.apply(Transition::ConnectionLost);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let decision = should_attempt_reconnection(
            self.failed_attempts,
            &self.shared.config.reconnect,
            self.disconnecting,
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.failed_attempts = attempt;
                self.shared.stats.record_reconnect();
                warn!(attempt, delay_ms, "Scheduling broker reconnect");
                self.emit(BusSignal::Reconnecting);

                let commands = self.shared.commands.clone();
                let connect_attempt = self.connect_attempt;
                self.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = commands.send(Command::RetryConnect {
                        attempt: connect_attempt,
                    });
                }));
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(
                    attempts = self.failed_attempts,
                    "Reconnect attempts exhausted; giving up"
                );
                self.state.apply(Transition::Abandon);
                self.emit(BusSignal::Disconnected);
            }
            ReconnectionDecision::AbortShutdownRequested => {
                debug!("Reconnect suppressed by disconnect");
            }
        }
    }

    /// Publish from the backlog until it is empty or the channel goes away
    async fn drain(&mut self) {
        let order = self.shared.config.drain_order;

        loop {
            if !self.state.is_connected() {
                return;
            }
            let Some(channel) = self.publish_channel.clone() else {
                return;
            };
            let Some(request) = self.shared.queue.pop(order) else {
                return;
            };

            let options = request.options.clone().unwrap_or_default();
            let result = channel
                .publish(
                    &request.exchange,
                    &request.routing_key,
                    &request.payload,
                    &options,
                )
                .instrument(publish_span!(
                    event_id = %request.routing_key,
                    exchange = %request.exchange
                ))
                .await;

            match result {
                Ok(()) => {
                    self.shared.stats.record_event_dequeued();
                    debug!(event_id = %request.routing_key, "Event published");
                    request.complete(Ok(()));
                }
                Err(error) => {
                    warn!(event_id = %request.routing_key, error = %error, "Event publish failed");
                    let event_id = request.routing_key.clone();
                    request.complete(Err(BusError::publish_failed(event_id, error)));
                }
            }
        }
    }

    async fn establish_consumer(&mut self) -> Result<(), BusError> {
        if !self.state.is_connected() || self.consumer_channel.is_some() {
            return Ok(());
        }
        let Some(connection) = self.connection.clone() else {
            return Ok(());
        };

        let channel = connection
            .create_channel()
            .await
            .map_err(BusError::ChannelCreation)?;

        let prefetch = self.shared.config.channel_prefetch_count;
        if prefetch > 0 {
            if let Err(error) = channel.prefetch(prefetch).await {
                warn!(prefetch, error = %error, "Failed to set consumer prefetch");
            }
        }

        for queue in self.shared.config.queue_names() {
            if let Err(error) = channel.assert_queue(queue).await {
                error!(queue = %queue, error = %error, "Failed to declare queue");
                continue;
            }
            match channel.consume(queue).await {
                Ok(stream) => {
                    info!(queue = %queue, "Consuming from queue");
                    let task = self.spawn_forwarder(queue, stream, channel.clone());
                    self.consumer_tasks.push(task);
                }
                Err(error) => {
                    error!(queue = %queue, error = %error, "Failed to start consumer");
                }
            }
        }

        self.consumer_channel = Some(channel);
        Ok(())
    }

    fn spawn_forwarder(
        &self,
        queue: &str,
        mut stream: DeliveryStream,
        channel: Arc<dyn BrokerChannel>,
    ) -> JoinHandle<()> {
        let commands = self.shared.commands.clone();
        let generation = self.generation;
        let span = consume_span!(queue = %queue, generation);

        tokio::spawn(
            async move {
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(delivery) => {
                            let command = Command::Deliver {
                                generation,
                                channel: channel.clone(),
                                delivery,
                            };
                            if commands.send(command).is_err() {
                                break;
                            }
                        }
                        Err(error) => warn!(error = %error, "Consumer stream error"),
                    }
                }
                debug!("Consumer stream ended");
            }
            .instrument(span),
        )
    }

    async fn dispatch(&mut self, channel: Arc<dyn BrokerChannel>, delivery: Delivery) {
        let event = match EventCodec::decode_event(&delivery.payload) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    queue = %delivery.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %error,
                    "Rejecting undecodable message"
                );
                if let Err(error) = channel.nack(delivery.delivery_tag, false, false).await {
                    warn!(error = %error, "Failed to reject undecodable message");
                }
                self.shared.stats.record_rejected(false);
                self.emit(BusSignal::EventNacked {
                    event: None,
                    requeue: false,
                    timestamp: timestamp_millis(),
                });
                return;
            }
        };

        debug!(
            queue = %delivery.queue,
            delivery_tag = delivery.delivery_tag,
            "Dispatching event to subscribers"
        );
        let message = Arc::new(InboundMessage::new(
            Arc::new(event),
            &delivery,
            channel,
            self.shared.commands.clone(),
            self.shared.stats.clone(),
            self.shared.notifier.clone(),
        ));
        self.shared.subscribers.dispatch(&message);
    }

    async fn settle(channel: Arc<dyn BrokerChannel>, delivery_tag: u64, outcome: Settlement) {
        let result = match outcome {
            Settlement::Acknowledge => channel.ack(delivery_tag).await,
            Settlement::Reject { requeue } => channel.nack(delivery_tag, false, requeue).await,
        };
        if let Err(error) = result {
            warn!(delivery_tag, outcome = ?outcome, error = %error, "Failed to settle message");
        }
    }

    async fn disconnect(&mut self) {
        self.disconnecting = true;
        self.abort_pending_connect();

        self.state.apply(Transition::Disconnect);
        self.emit(BusSignal::Disconnecting);
        self.fail_pending_requests();
        StatsReporter::report(&self.shared.stats, &self.shared.notifier);

        let connection = self.connection.clone();
        self.drop_connection();
        if let Some(connection) = connection {
            if let Err(error) = connection.close().await {
                warn!(error = %error, "Failed to close broker connection");
            }
        }

        self.state.apply(Transition::Closed);
        info!("Event bus disconnected");
        self.emit(BusSignal::Disconnected);
    }

    /// Escalate an unrecoverable failure and stop the orchestrator
    async fn fail_fatally(&mut self, failure: BusError) -> Flow {
        error!(error = %failure, "Unrecoverable broker failure; stopping event bus");
        self.emit(BusSignal::Error {
            message: failure.to_string(),
        });

        self.fail_pending_requests();

        self.disconnecting = true;
        self.abort_pending_connect();
        let connection = self.connection.clone();
        self.drop_connection();
        if let Some(connection) = connection {
            if let Err(error) = connection.close().await {
                warn!(error = %error, "Failed to close broker connection");
            }
        }

        self.state.apply(Transition::Disconnect);
        self.state.apply(Transition::Closed);
        self.emit(BusSignal::Disconnected);
        Flow::Stop
    }

    /// Close the backlog; queued and later raises complete with `Closed`
    fn fail_pending_requests(&self) {
        let pending = self.shared.queue.close();
        if !pending.is_empty() {
            info!(pending = pending.len(), "Failing queued events on shutdown");
        }
        for request in pending {
            self.shared.stats.record_event_dequeued();
            request.complete(Err(BusError::Closed));
        }
    }

    fn abort_pending_connect(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }

    /// Forget the connection and both channels
    fn drop_connection(&mut self) {
        for task in self.consumer_tasks.drain(..) {
            task.abort();
        }
        self.publish_channel = None;
        self.consumer_channel = None;
        self.connection = None;
    }

    fn abort_tasks(&mut self) {
        for task in self.consumer_tasks.drain(..) {
            task.abort();
        }
        self.abort_pending_connect();
    }
}

impl Drop for BusCore {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
