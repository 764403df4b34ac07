//! Channel pooling
//!
//! Every broker operation runs against one channel borrowed from a
//! [`ChannelPool`]. [`with_resource`] is the only way the emitter touches the
//! pool: a channel is released after a successful operation and destroyed
//! after a failed one, exactly once either way.

pub mod bounded;

use std::ops::{Deref, DerefMut};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, BrokerError};

pub use bounded::{BoundedPool, ChannelManager, Pooled};

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_size: 5 }
    }
}

impl PoolConfig {
    /// Read `COURIER_POOL_MAX_SIZE`, falling back to the default
    pub fn from_env() -> Self {
        Self {
            max_size: std::env::var("COURIER_POOL_MAX_SIZE")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
        }
    }

    /// A pool needs at least one channel and at most what a semaphore can count
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 || self.max_size > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(PoolError::InvalidSize(self.max_size));
        }
        Ok(())
    }
}

// Error types for pool operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,

    #[error("Failed to open channel: {0}")]
    Create(BrokerError),

    #[error("Invalid pool size {0}")]
    InvalidSize(usize),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Counters describing pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub destroyed: u64,
    pub idle: usize,
    pub in_use: usize,
}

impl PoolStats {
    /// Every acquired handle has been either released or destroyed
    pub fn is_balanced(&self) -> bool {
        self.in_use == 0 && self.acquired == self.released + self.destroyed
    }
}

/// A shared set of broker channels
#[async_trait::async_trait]
pub trait ChannelPool: Send + Sync {
    type Handle: BrokerChannel + Send;

    /// Wait until a handle is available
    async fn acquire(&self) -> PoolResult<Self::Handle>;

    /// Return a healthy handle
    fn release(&self, handle: Self::Handle);

    /// Discard a handle whose connection is in an unknown state
    fn destroy(&self, handle: Self::Handle);

    fn stats(&self) -> PoolStats;
}

/// Exclusive hold on one pooled handle
///
/// Dropping the guard without calling [`PooledGuard::release`] destroys the
/// handle, so an operation abandoned mid-flight never returns a channel in an
/// unknown state to the pool.
pub struct PooledGuard<'p, P: ChannelPool + ?Sized> {
    pool: &'p P,
    handle: Option<P::Handle>,
}

impl<'p, P: ChannelPool + ?Sized> PooledGuard<'p, P> {
    pub async fn acquire(pool: &'p P) -> PoolResult<Self> {
        let handle = pool.acquire().await?;
        Ok(Self {
            pool,
            handle: Some(handle),
        })
    }

    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }

    pub fn destroy(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.destroy(handle);
        }
    }
}

impl<P: ChannelPool + ?Sized> Deref for PooledGuard<'_, P> {
    type Target = P::Handle;

    fn deref(&self) -> &Self::Target {
        // Only `release`/`destroy`/`drop` empty the slot, and all consume the guard
        self.handle.as_ref().expect("pooled handle already returned")
    }
}

impl<P: ChannelPool + ?Sized> DerefMut for PooledGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_mut().expect("pooled handle already returned")
    }
}

impl<P: ChannelPool + ?Sized> Drop for PooledGuard<'_, P> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("Pooled channel dropped before completion, destroying it");
            self.pool.destroy(handle);
        }
    }
}

/// Run one operation against a pooled handle
///
/// The handle goes back to the pool when `operation` succeeds and is destroyed
/// when it fails; the operation's error is returned as is.
pub async fn with_resource<P, T, E, F>(pool: &P, operation: F) -> Result<T, E>
where
    P: ChannelPool + ?Sized,
    E: From<PoolError>,
    F: for<'h> FnOnce(&'h mut P::Handle) -> BoxFuture<'h, Result<T, E>>,
{
    let mut guard = PooledGuard::acquire(pool).await?;

    match operation(&mut *guard).await {
        Ok(value) => {
            guard.release();
            Ok(value)
        }
        Err(e) => {
            debug!("Pooled operation failed, destroying channel");
            guard.destroy();
            Err(e)
        }
    }
}
