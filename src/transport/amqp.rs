//! `lapin` implementation of the broker boundary
//!
//! Queues are declared durable, consumers use a generated consumer tag and
//! publishes wait for the broker's confirmation future before returning.

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ClientProperties,
    Delivery, DeliveryStream, ErrorHandler, PublishOptions,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/json";
const REPLY_SUCCESS: u16 = 200;

/// Broker entry point backed by `lapin`
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

/// Build the AMQP client property table from the detected process identity
pub fn client_property_table(properties: &ClientProperties) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(ip) = &properties.ip {
        table.insert("ip".into(), AMQPValue::LongString(ip.as_str().into()));
    }
    if let Some(hostname) = &properties.hostname {
        table.insert(
            "hostname".into(),
            AMQPValue::LongString(hostname.as_str().into()),
        );
    }
    table.insert(
        "application".into(),
        AMQPValue::LongString(properties.application.as_str().into()),
    );
    table
}

/// Map publish options onto AMQP basic properties
pub fn basic_properties(options: &PublishOptions) -> BasicProperties {
    let content_type = options
        .content_type
        .as_deref()
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    let mut properties = BasicProperties::default().with_content_type(content_type.into());

    if options.persistent {
        properties = properties.with_delivery_mode(2);
    }
    if let Some(message_id) = &options.message_id {
        properties = properties.with_message_id(message_id.as_str().into());
    }
    if let Some(correlation_id) = &options.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(expiration) = &options.expiration {
        properties = properties.with_expiration(expiration.as_str().into());
    }
    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority);
    }
    if !options.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &options.headers {
            headers.insert(
                key.as_str().into(),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
        properties = properties.with_headers(headers);
    }
    properties
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        url: &str,
        properties: &ClientProperties,
    ) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let mut connection_properties = ConnectionProperties::default();
        connection_properties.client_properties = client_property_table(properties);
        let connection_properties =
            connection_properties.with_connection_name(properties.application.as_str().into());

        let connection = Connection::connect(url, connection_properties)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            application: properties.application.clone(),
        }))
    }
}

/// Live `lapin` connection
pub struct AmqpConnection {
    inner: Connection,
    application: String,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel {
            inner: channel,
            consumer_prefix: self.application.clone(),
        }))
    }

    fn on_error(&self, mut handler: ErrorHandler) {
        self.inner
            .on_error(move |error| handler(BrokerError::ConnectionLost(error.to_string())));
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner
            .close(REPLY_SUCCESS, "event bus disconnecting")
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

/// `lapin` channel
pub struct AmqpChannel {
    inner: Channel,
    consumer_prefix: String,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn prefetch(&self, count: u16) -> BrokerResult<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn assert_queue(&self, queue: &str) -> BrokerResult<()> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::QueueDeclare {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        let consumer_tag = format!("{}-{}", self.consumer_prefix, Uuid::new_v4());
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer attached");

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| {
            delivery
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    queue: queue.clone(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                    payload: delivery.data.into(),
                })
                .map_err(|e| BrokerError::Consume {
                    queue: queue.clone(),
                    reason: e.to_string(),
                })
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> BrokerResult<()> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> BrokerResult<()> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..Default::default()
                },
                payload,
                basic_properties(options),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}
