//! Observability utilities for logging, tracing, and metrics

pub mod logging;
pub mod metrics;
pub mod trace;

pub use logging::{init_default_logging, init_logging, LogConfig, LogFormat, LogLevel};
pub use metrics::{metric_names, MetricsCollector, MetricsSnapshot};
pub use trace::{Carrier, Span, SpanContext, SpanOptions, Tracer, W3cTracer, TRACEPARENT};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Logging setup error: {0}")]
    Logging(String),
}

pub type ObservabilityResult<T> = Result<T, ObservabilityError>;
