//! Observability: structured logging and in-process metrics

pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, init_default_logging, init_logging};
pub use metrics::{MetricsCollector, MetricsSnapshot, metrics};

// Span macros for structured logging
pub use logging::{mqtt_span, tick_span};
