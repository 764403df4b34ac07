//! In-process broker that records traffic
//!
//! Behaves like an AMQP broker for the parts the emitter uses: queue
//! declarations are idempotent and reject inequivalent arguments, publishes
//! and direct queue sends are recorded in order. Failures can be injected per
//! operation to exercise cleanup paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{BrokerChannel, BrokerError, BrokerResult, MessageProperties, QueueOptions};
use crate::pool::ChannelManager;

/// Broker operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Publish,
    SendToQueue,
    AssertQueue,
}

/// A message published to an exchange
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message sent directly to a queue
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueOptions>,
    declarations: Vec<(String, QueueOptions)>,
    published: Vec<PublishedMessage>,
    routed: Vec<RoutedMessage>,
    queued_failures: HashMap<Operation, VecDeque<BrokerError>>,
    failing_routing_keys: HashMap<String, BrokerError>,
}

/// Shared handle to the in-process broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    channels_opened: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel on this broker
    pub fn channel(&self) -> MemoryChannel {
        let id = self.channels_opened.fetch_add(1, Ordering::SeqCst) + 1;
        MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Channel factory for a pool
    pub fn manager(&self) -> MemoryChannelManager {
        MemoryChannelManager {
            broker: self.clone(),
        }
    }

    /// Pre-declare a queue as if another producer had done so
    pub fn declare(&self, name: &str, options: QueueOptions) {
        self.state.lock().queues.insert(name.to_string(), options);
    }

    /// Fail the next call of `operation` with `error`
    pub fn fail_next(&self, operation: Operation, error: BrokerError) {
        self.state
            .lock()
            .queued_failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Fail every publish under `routing_key` with `error`
    pub fn fail_routing_key(&self, routing_key: &str, error: BrokerError) {
        self.state
            .lock()
            .failing_routing_keys
            .insert(routing_key.to_string(), error);
    }

    pub fn queue(&self, name: &str) -> Option<QueueOptions> {
        self.state.lock().queues.get(name).cloned()
    }

    /// Every declaration attempt, including failed ones
    pub fn declarations(&self) -> Vec<(String, QueueOptions)> {
        self.state.lock().declarations.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn routed(&self) -> Vec<RoutedMessage> {
        self.state.lock().routed.clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }
}

/// One channel on a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryChannel {
    id: usize,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl BrokerState {
    fn take_failure(&mut self, operation: Operation) -> Option<BrokerError> {
        self.queued_failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_failure(Operation::Publish) {
            return Err(err);
        }
        if let Some(err) = state.failing_routing_keys.get(routing_key) {
            return Err(err.clone());
        }

        debug!(channel = self.id, exchange, routing_key, "memory publish");
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn send_to_queue(
        &mut self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_failure(Operation::SendToQueue) {
            return Err(err);
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Rejected(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        debug!(channel = self.id, queue, "memory send to queue");
        state.routed.push(RoutedMessage {
            queue: queue.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn assert_queue(&mut self, name: &str, options: &QueueOptions) -> BrokerResult<()> {
        let mut state = self.state.lock();
        state.declarations.push((name.to_string(), options.clone()));
        if let Some(err) = state.take_failure(Operation::AssertQueue) {
            return Err(err);
        }

        match state.queues.get(name) {
            None => {
                state.queues.insert(name.to_string(), options.clone());
                Ok(())
            }
            Some(existing) => match first_inequivalent(existing, options) {
                None => Ok(()),
                Some(argument) => Err(BrokerError::PreconditionFailed {
                    message: format!(
                        "PRECONDITION_FAILED - inequivalent arg '{}' for queue '{}' in vhost '/'",
                        argument, name
                    ),
                    argument,
                }),
            },
        }
    }
}

fn first_inequivalent(existing: &QueueOptions, requested: &QueueOptions) -> Option<String> {
    if existing.durable != requested.durable {
        return Some("durable".to_string());
    }
    if existing.exclusive != requested.exclusive {
        return Some("exclusive".to_string());
    }
    if existing.auto_delete != requested.auto_delete {
        return Some("auto_delete".to_string());
    }

    let current = existing.arguments();
    let wanted = requested.arguments();
    current
        .keys()
        .chain(wanted.keys())
        .find(|key| current.get(*key) != wanted.get(*key))
        .map(|key| key.to_string())
}

/// Creates [`MemoryChannel`]s for a pool
#[derive(Debug, Clone)]
pub struct MemoryChannelManager {
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl ChannelManager for MemoryChannelManager {
    type Channel = MemoryChannel;

    async fn create(&self) -> BrokerResult<MemoryChannel> {
        Ok(self.broker.channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::arguments;

    fn delay_queue(expires: u64) -> QueueOptions {
        QueueOptions {
            durable: true,
            auto_delete: true,
            dead_letter_exchange: Some("courier".to_string()),
            dead_letter_routing_key: Some("order.created".to_string()),
            expires: Some(expires),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_redeclare_identical_is_noop() {
        let broker = MemoryBroker::new();
        let mut channel = broker.channel();

        channel.assert_queue("d:courier:order.created:1", &delay_queue(1000)).await.unwrap();
        channel.assert_queue("d:courier:order.created:1", &delay_queue(1000)).await.unwrap();

        assert_eq!(broker.declarations().len(), 2);
        assert_eq!(broker.queue("d:courier:order.created:1"), Some(delay_queue(1000)));
    }

    #[tokio::test]
    async fn test_inequivalent_expiry_conflicts() {
        let broker = MemoryBroker::new();
        let mut channel = broker.channel();

        channel.assert_queue("q", &delay_queue(1000)).await.unwrap();
        let err = channel.assert_queue("q", &delay_queue(2000)).await.unwrap_err();

        assert!(err.is_inequivalent_arg(arguments::EXPIRES));
        assert_eq!(broker.queue("q"), Some(delay_queue(1000)));
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let broker = MemoryBroker::new();
        let mut channel = broker.channel();
        let properties = MessageProperties {
            message_id: "m-1".to_string(),
            app_id: "test".to_string(),
            timestamp: 0,
            headers: Default::default(),
            content_type: "application/json".to_string(),
            persistent: true,
            priority: None,
            expiration: None,
        };

        broker.fail_next(Operation::Publish, BrokerError::ChannelClosed("reset".to_string()));

        assert!(channel.publish("x", "k", b"null", &properties).await.is_err());
        assert!(channel.publish("x", "k", b"null", &properties).await.is_ok());
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_send_to_missing_queue_rejected() {
        let broker = MemoryBroker::new();
        let mut channel = broker.channel();
        let properties = MessageProperties {
            message_id: "m-1".to_string(),
            app_id: "test".to_string(),
            timestamp: 0,
            headers: Default::default(),
            content_type: "application/json".to_string(),
            persistent: true,
            priority: None,
            expiration: None,
        };

        let err = channel.send_to_queue("nope", b"{}", &properties).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }
}
