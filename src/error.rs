//! Error taxonomy for the event bus
//!
//! [`UsageError`] is returned synchronously for malformed calls. Everything
//! else reaches callers as a [`BusError`] through a completion callback or a
//! settlement result, never as a panic.

use crate::bus::codec::CodecError;
use crate::config::ConfigError;
use crate::transport::BrokerError;
use thiserror::Error;

/// Programmer errors reported at the call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("afterRaised must be a callback; options were given without a completion callback")]
    MissingCallback,

    #[error("afterRaised is ambiguous: the third argument is a callback and a fourth callback was also given")]
    AmbiguousCallback,

    #[error("No queue configured")]
    NoQueueConfigured,
}

/// Errors delivered asynchronously by the bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("eventId must be a string and cannot be empty")]
    InvalidEventId,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Event {event_id} failed to publish due to error: {source}")]
    PublishFailed {
        event_id: String,
        #[source]
        source: BrokerError,
    },

    #[error("Message has already been acknowledged or rejected")]
    AlreadySettled,

    #[error("Event bus is closed")]
    Closed,

    #[error("Failed to create broker channel: {0}")]
    ChannelCreation(#[source] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event bus must be built inside a tokio runtime")]
    NoRuntime,
}

impl BusError {
    pub fn publish_failed(event_id: impl Into<String>, source: BrokerError) -> Self {
        Self::PublishFailed {
            event_id: event_id.into(),
            source,
        }
    }
}

pub type BusResult<T> = Result<T, BusError>;
