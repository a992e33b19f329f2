//! Observability: structured logging and process metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{command_span, lifecycle_span, mqtt_span};
