//! busterbunny - a resilient AMQP event bus client
//!
//! Wraps one broker connection behind a small facade:
//! - events raised while disconnected are queued and published once a channel is available
//! - connection failures are retried with a configurable delay
//! - consumed messages fan out to in-process subscribers that acknowledge or reject them
//! - backlog and subscriber thresholds raise warnings, and counters are reported periodically
//!
//! # Quick Start
//!
//! ```no_run
//! use busterbunny::{BusConfig, EventBus, QueueConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = BusConfig::new("localhost", "domain-events");
//! config.queues.push(QueueConfig { name: "billing.invoices".into() });
//!
//! let bus = EventBus::builder(config).build()?;
//!
//! bus.subscribe(|event, message| {
//!     println!("received {event}");
//!     let _ = message.acknowledge();
//! })?;
//!
//! bus.publish("invoice.created", &serde_json::json!({"id": 7}), None).await?;
//! bus.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use bus::publish_queue::{AfterRaised, DrainOrder};
pub use bus::reconnect::ReconnectConfig;
pub use bus::signals::{BusSignal, ListenerId, SignalKind};
pub use bus::state::ConnectionState;
pub use bus::subscription::InboundMessage;
pub use bus::{EventBus, EventBusBuilder, RaiseArg};
pub use config::{BusConfig, ClusterConfig, ConfigError, QueueConfig, Thresholds};
pub use error::{BusError, BusResult, UsageError};
pub use observability::StatsSnapshot;
pub use transport::{
    AmqpBroker, Broker, BrokerError, ClientProperties, ConnectionRegistry, PublishOptions,
};
