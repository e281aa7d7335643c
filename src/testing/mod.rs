//! Testing utilities
//!
//! An in-memory [`MockBroker`] that stands in for RabbitMQ, and a
//! [`SignalRecorder`] that captures everything a bus emits.

pub mod mocks;

pub use mocks::*;
