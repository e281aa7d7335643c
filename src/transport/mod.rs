//! Broker collaborator boundary
//!
//! The event bus never talks to the wire protocol directly. It drives the
//! traits in this module, which the [`amqp`] module implements on top of
//! `lapin` and [`crate::testing::MockBroker`] implements in memory.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use sysinfo::{Networks, System};
use thiserror::Error;

pub mod amqp;
pub mod registry;

pub use amqp::AmqpBroker;
pub use registry::ConnectionRegistry;

/// Errors reported by the broker client library
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Failed to declare queue {queue}: {reason}")]
    QueueDeclare { queue: String, reason: String },
    #[error("Failed to consume from queue {queue}: {reason}")]
    Consume { queue: String, reason: String },
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),
    #[error("Close failed: {0}")]
    Close(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Callback armed on a live connection, invoked on connection-level errors
pub type ErrorHandler = Box<dyn FnMut(BrokerError) + Send + 'static>;

/// Stream of deliveries for one consumed queue
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Identification metadata sent to the broker when connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProperties {
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub application: String,
}

static HOST_IDENTITY: Lazy<(Option<String>, Option<String>)> = Lazy::new(|| {
    let hostname = System::host_name();
    let networks = Networks::new_with_refreshed_list();
    let ip = networks
        .iter()
        .flat_map(|(_, data)| data.ip_networks().iter())
        .map(|network| network.addr)
        .find(|addr| addr.is_ipv4() && !addr.is_loopback())
        .map(|addr| addr.to_string());
    (ip, hostname)
});

impl ClientProperties {
    /// Detect the process identity once and reuse it for every connection
    pub fn detect(application: Option<&str>) -> Self {
        let application = application
            .map(str::to_string)
            .or_else(|| {
                std::env::current_exe().ok().and_then(|exe| {
                    exe.file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                })
            })
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

        let (ip, hostname) = HOST_IDENTITY.clone();
        Self {
            ip,
            hostname,
            application,
        }
    }
}

/// A message delivered by the broker on a consumer channel
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Bytes,
}

/// Broker-specific publish options
///
/// Mirrors the subset of AMQP basic properties callers routinely set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Ask the broker to persist the message (delivery mode 2)
    #[serde(default)]
    pub persistent: bool,
    /// Return the message if it cannot be routed
    #[serde(default)]
    pub mandatory: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Per-message TTL in milliseconds, as the broker expects it (a string)
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Entry point of the broker client library
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Establish a connection to `url`, identifying the client with `properties`
    async fn connect(
        &self,
        url: &str,
        properties: &ClientProperties,
    ) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// An established broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new multiplexed channel on this connection
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Arm a handler for asynchronous connection-level errors
    fn on_error(&self, handler: ErrorHandler);

    /// Close the connection
    async fn close(&self) -> BrokerResult<()>;
}

/// A channel on a broker connection, used either for publishing or consuming
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries on this channel
    async fn prefetch(&self, count: u16) -> BrokerResult<()>;

    /// Idempotently assert that a queue exists
    async fn assert_queue(&self, queue: &str) -> BrokerResult<()>;

    /// Start consuming from a queue
    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> BrokerResult<()>;
}
