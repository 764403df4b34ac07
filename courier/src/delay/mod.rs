//! Delayed and scheduled delivery
//!
//! Deferred messages are parked in an auxiliary queue that has no consumers.
//! When a message expires there the broker dead-letters it back to the origin
//! exchange under the original event, which is when subscribers see it.
//!
//! Queue names are derived from exchange, event and a group key: the delay in
//! milliseconds, or the target timestamp for scheduled sends. Sends with the
//! same delay share one queue; each distinct schedule gets its own. Queues
//! are never deleted here; `x-expires` lets the broker reclaim them.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::broker::{arguments, BrokerChannel, QueueOptions};
use crate::observability::{metric_names, MetricsCollector};
use crate::options::{EmissionOptions, Timing};
use crate::pool::{with_resource, ChannelPool};
use crate::{CourierError, Result};

/// Extra lifetime given to a schedule queue past its single message's expiry
pub const SCHEDULE_GRACE_MILLIS: u64 = 60_000;

/// Longest expiry a broker accepts for `x-message-ttl` or a message expiration
pub const MAX_EXPIRATION_MILLIS: u64 = u32::MAX as u64;

/// Prefix of every delay queue name
pub const DELAY_QUEUE_PREFIX: &str = "d";

/// How a deferred message reaches its delivery time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    /// Relative delay, enforced by the queue's message TTL
    Delay { millis: u64 },
    /// Absolute time, enforced by the message's own expiration
    Schedule { at: DateTime<Utc> },
}

/// Auxiliary queue a deferred message goes through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayQueueDescriptor {
    pub queue_name: String,
    pub expiration_millis: u64,
    pub kind: DelayKind,
    pub queue_options: QueueOptions,
}

impl DelayQueueDescriptor {
    pub fn is_scheduled(&self) -> bool {
        matches!(self.kind, DelayKind::Schedule { .. })
    }
}

pub fn queue_name(exchange: &str, event: &str, group: impl std::fmt::Display) -> String {
    format!("{}:{}:{}:{}", DELAY_QUEUE_PREFIX, exchange, event, group)
}

/// Decides between immediate and deferred delivery for one exchange
#[derive(Debug, Clone)]
pub struct DelayResolver<'a> {
    exchange: &'a str,
}

impl<'a> DelayResolver<'a> {
    pub fn new(exchange: &'a str) -> Self {
        Self { exchange }
    }

    /// `Ok(None)` means send immediately
    ///
    /// A delay or schedule that is present but malformed is an error rather
    /// than an immediate send. A schedule already due, or a zero delay, sends
    /// immediately.
    pub fn resolve(
        &self,
        options: &EmissionOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<DelayQueueDescriptor>> {
        let (group, expiration, kind) = match &options.timing {
            None => return Ok(None),
            Some(Timing::Delay(delay)) => match delay.millis()? {
                None => return Ok(None),
                Some(millis) => {
                    check_expiration(&options.event, millis)?;
                    let group = millis as i64;
                    (group, group, DelayKind::Delay { millis })
                }
            },
            Some(Timing::Schedule(schedule)) => {
                let at = schedule.timestamp()?;
                let group = at.timestamp_millis();
                (group, group - now.timestamp_millis(), DelayKind::Schedule { at })
            }
        };

        if expiration < 1 {
            debug!(
                event = %options.event,
                expiration_ms = expiration,
                "Delivery time already reached"
            );
            return Ok(None);
        }
        let expiration = expiration as u64;
        check_expiration(&options.event, expiration)?;

        let mut queue_options = QueueOptions {
            exclusive: false,
            durable: true,
            auto_delete: true,
            dead_letter_exchange: Some(self.exchange.to_string()),
            dead_letter_routing_key: Some(options.event.clone()),
            ..Default::default()
        };
        match kind {
            DelayKind::Delay { .. } => {
                queue_options.message_ttl = Some(expiration);
                queue_options.expires = Some(expiration.saturating_mul(2));
            }
            DelayKind::Schedule { .. } => {
                queue_options.expires = Some(expiration.saturating_add(SCHEDULE_GRACE_MILLIS));
            }
        }

        Ok(Some(DelayQueueDescriptor {
            queue_name: queue_name(self.exchange, &options.event, group),
            expiration_millis: expiration,
            kind,
            queue_options,
        }))
    }

    /// Make sure the descriptor's queue exists
    ///
    /// A scheduled send that finds its queue already declared with a different
    /// `x-expires` uses that queue as it is.
    pub async fn declare<P>(
        &self,
        pool: &P,
        descriptor: &DelayQueueDescriptor,
        metrics: &MetricsCollector,
    ) -> Result<()>
    where
        P: ChannelPool + ?Sized,
    {
        let name = descriptor.queue_name.clone();
        let queue_options = descriptor.queue_options.clone();

        let declared = with_resource(pool, move |channel| {
            Box::pin(async move {
                channel
                    .assert_queue(&name, &queue_options)
                    .await
                    .map_err(CourierError::from)
            })
        })
        .await;

        match declared {
            Err(CourierError::Broker(err))
                if descriptor.is_scheduled() && err.is_inequivalent_arg(arguments::EXPIRES) =>
            {
                info!(
                    queue = %descriptor.queue_name,
                    error = %err,
                    "Schedule queue exists with a different expiry, reusing it"
                );
                metrics.increment_counter(metric_names::TOLERATED_CONFLICTS_TOTAL, 1);
                Ok(())
            }
            other => other,
        }
    }
}

fn check_expiration(event: &str, millis: u64) -> Result<()> {
    if millis > MAX_EXPIRATION_MILLIS {
        return Err(CourierError::Validation(format!(
            "Delivery of '{}' is {}ms away, more than the {}ms a broker can hold",
            event, millis, MAX_EXPIRATION_MILLIS
        )));
    }
    Ok(())
}
