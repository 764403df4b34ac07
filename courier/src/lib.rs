//! Event emitter for AMQP-style brokers
//!
//! Builds message envelopes, defers delivery through dead-lettering delay
//! queues when asked to, and publishes over a pool of broker channels while
//! propagating trace context to consumers.

// Re-export common dependencies
pub use chrono;
pub use serde_json;
pub use tracing;

pub mod broker;
pub mod config;
pub mod context;
pub mod delay;
pub mod emitter;
pub mod envelope;
pub mod observability;
pub mod options;
pub mod pool;

pub use broker::{BrokerChannel, BrokerError, MessageProperties, QueueOptions};
pub use config::CourierConfig;
pub use context::ExecutionContext;
pub use delay::{DelayQueueDescriptor, DelayResolver};
pub use emitter::{Courier, Emitter, Flow, SentEvent, SENT};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use options::{Delay, EmissionOptions, OptionsInput, Schedule};
pub use pool::{BoundedPool, ChannelManager, ChannelPool, PoolError, PoolStats};

/// Errors surfaced by [`Emitter::send`]
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CourierError {
    /// Whether a caller-side retry could succeed. Nothing in this crate retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            CourierError::Validation(_) | CourierError::Config(_) => false,
            CourierError::Pool(PoolError::Closed | PoolError::InvalidSize(_)) => false,
            CourierError::Pool(_) => true,
            CourierError::Broker(err) => err.is_retryable(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
