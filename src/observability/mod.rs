//! Observability: structured logging, per-bus stats and periodic reporting

pub mod logging;
pub mod reporter;
pub mod stats;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use reporter::StatsReporter;
pub use stats::{Stats, StatsSnapshot};

pub(crate) use logging::{consume_span, publish_span};
