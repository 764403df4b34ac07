use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{ChannelPool, PoolConfig, PoolError, PoolResult, PoolStats};
use crate::broker::{BrokerChannel, BrokerResult, MessageProperties, QueueOptions};

/// Opens new broker channels for a [`BoundedPool`]
#[async_trait::async_trait]
pub trait ChannelManager: Send + Sync + 'static {
    type Channel: BrokerChannel + Send + 'static;

    async fn create(&self) -> BrokerResult<Self::Channel>;
}

/// A channel checked out of a [`BoundedPool`]
///
/// Holds one of the pool's permits for as long as it is out.
#[derive(Debug)]
pub struct Pooled<C> {
    channel: C,
    _permit: OwnedSemaphorePermit,
}

impl<C> Pooled<C> {
    pub fn channel(&self) -> &C {
        &self.channel
    }
}

#[async_trait::async_trait]
impl<C: BrokerChannel> BrokerChannel for Pooled<C> {
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        self.channel.publish(exchange, routing_key, body, properties).await
    }

    async fn send_to_queue(
        &mut self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        self.channel.send_to_queue(queue, body, properties).await
    }

    async fn assert_queue(&mut self, name: &str, options: &QueueOptions) -> BrokerResult<()> {
        self.channel.assert_queue(name, options).await
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    destroyed: AtomicU64,
}

/// Semaphore-bounded channel pool
///
/// At most `max_size` channels are out at once; further acquires wait.
/// Channels are opened lazily and released ones are reused.
pub struct BoundedPool<M: ChannelManager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<Vec<M::Channel>>,
    permits: Arc<Semaphore>,
    counters: Counters,
}

impl<M: ChannelManager> BoundedPool<M> {
    /// Fails with [`PoolError::InvalidSize`] unless `max_size` is at least 1
    pub fn new(manager: M, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        info!("Creating channel pool with {} max channels", config.max_size);

        Ok(Self {
            manager,
            permits: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            config,
            counters: Counters::default(),
        })
    }

    /// Stop handing out channels and drop the idle ones
    pub fn close(&self) {
        info!("Closing channel pool...");
        self.permits.close();
        self.idle.lock().clear();
    }
}

#[async_trait::async_trait]
impl<M: ChannelManager> ChannelPool for BoundedPool<M> {
    type Handle = Pooled<M::Channel>;

    async fn acquire(&self) -> PoolResult<Self::Handle> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let reused = self.idle.lock().pop();
        let channel = match reused {
            Some(channel) => channel,
            None => {
                let channel = self.manager.create().await.map_err(PoolError::Create)?;
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!("Opened new pooled channel");
                channel
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Pooled {
            channel,
            _permit: permit,
        })
    }

    fn release(&self, handle: Self::Handle) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        if self.permits.is_closed() {
            return;
        }
        let Pooled { channel, _permit } = handle;
        self.idle.lock().push(channel);
    }

    fn destroy(&self, handle: Self::Handle) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!("Destroyed pooled channel");
        drop(handle);
    }

    fn stats(&self) -> PoolStats {
        let available = self.permits.available_permits();
        PoolStats {
            max_size: self.config.max_size,
            created: self.counters.created.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            in_use: if self.permits.is_closed() {
                0
            } else {
                self.config.max_size.saturating_sub(available)
            },
        }
    }
}
