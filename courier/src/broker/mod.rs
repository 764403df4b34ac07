//! Broker channel abstraction
//!
//! The emitter talks to the broker only through [`BrokerChannel`]. Connection
//! establishment belongs to whoever implements the trait and hands channels to
//! the pool.

pub mod memory;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryBroker, MemoryChannel, MemoryChannelManager};

/// Queue argument names understood by AMQP brokers
pub mod arguments {
    pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
    pub const MESSAGE_TTL: &str = "x-message-ttl";
    pub const EXPIRES: &str = "x-expires";
}

/// Broker failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// An existing entity was declared with a different value for `argument`
    #[error("Precondition failed on '{argument}': {message}")]
    PreconditionFailed { argument: String, message: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl BrokerError {
    /// True when this is a declaration conflict on exactly the named argument
    pub fn is_inequivalent_arg(&self, name: &str) -> bool {
        matches!(self, BrokerError::PreconditionFailed { argument, .. } if argument == name)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed(_) | BrokerError::Io(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Application headers attached to every emitted message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Source location of the code that requested the send
    pub trace: String,
    /// Trace propagation carrier
    pub context: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<i64>,
}

/// Transport metadata for a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProperties {
    pub message_id: String,
    pub app_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub headers: MessageHeaders,
    pub content_type: String,
    pub persistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}

/// Parameters for a queue declaration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<u64>,
    pub expires: Option<u64>,
}

impl QueueOptions {
    /// The `x-` argument table as sent on the wire
    pub fn arguments(&self) -> BTreeMap<&'static str, serde_json::Value> {
        let mut table = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            table.insert(arguments::DEAD_LETTER_EXCHANGE, exchange.clone().into());
        }
        if let Some(key) = &self.dead_letter_routing_key {
            table.insert(arguments::DEAD_LETTER_ROUTING_KEY, key.clone().into());
        }
        if let Some(ttl) = self.message_ttl {
            table.insert(arguments::MESSAGE_TTL, ttl.into());
        }
        if let Some(expires) = self.expires {
            table.insert(arguments::EXPIRES, expires.into());
        }

        table
    }
}

/// One exclusively held channel to the broker
#[async_trait::async_trait]
pub trait BrokerChannel: Send {
    /// Publish to an exchange under a routing key
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()>;

    /// Deliver straight to a named queue through the default exchange
    async fn send_to_queue(
        &mut self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()>;

    /// Declare a queue. Redeclaring with identical options is a no-op.
    async fn assert_queue(&mut self, name: &str, options: &QueueOptions) -> BrokerResult<()>;
}
