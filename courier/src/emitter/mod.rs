//! Event emission
//!
//! A [`Courier`] ties an exchange, a producer identity and a channel pool
//! together. Each [`Emitter`] it hands out sends one kind of event:
//!
//! ```text
//! send ─▶ build envelope ─▶ resolve delay ─▶ declare delay queue? ─▶ publish / route
//!                                                                      │
//!                                      listeners ◀─ yield ◀─ finish span
//! ```
//!
//! A send is a single attempt. Failures propagate to the caller unchanged
//! after the channel that saw them has been destroyed.

mod event;
mod listeners;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::BrokerChannel;
use crate::config::CourierConfig;
use crate::context;
use crate::delay::{DelayKind, DelayQueueDescriptor, DelayResolver};
use crate::envelope::{CallSite, Envelope, EnvelopeBuilder};
use crate::observability::{metric_names, MetricsCollector, Span, Tracer, W3cTracer};
use crate::options::{EmissionOptions, OptionsInput};
use crate::pool::{with_resource, ChannelPool};
use crate::{CourierError, Result};

pub use event::{Flow, SentEvent};
pub use listeners::Listeners;

/// Local notification fired after every successful send
pub const SENT: &str = "sent";

/// Entry point: one exchange, one producer identity, one pool
pub struct Courier<P: ChannelPool> {
    exchange: String,
    app_id: String,
    pool: Arc<P>,
    tracer: Arc<dyn Tracer>,
    metrics: Arc<MetricsCollector>,
}

impl<P: ChannelPool> Clone for Courier<P> {
    fn clone(&self) -> Self {
        Self {
            exchange: self.exchange.clone(),
            app_id: self.app_id.clone(),
            pool: Arc::clone(&self.pool),
            tracer: Arc::clone(&self.tracer),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<P: ChannelPool> Courier<P> {
    pub fn new(config: &CourierConfig, pool: P) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CourierError::Config(e.to_string()))?;

        info!(
            exchange = %config.exchange,
            app_id = %config.app_id,
            "Courier initialized"
        );

        Ok(Self {
            exchange: config.exchange.clone(),
            app_id: config.app_id.clone(),
            pool: Arc::new(pool),
            tracer: Arc::new(W3cTracer),
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Emitter for the event described by `input`
    pub fn emitter(&self, input: impl Into<OptionsInput>) -> Result<Emitter<P>> {
        let defaults = input.into().into_options();
        defaults.validate()?;

        Ok(Emitter {
            courier: self.clone(),
            defaults: RwLock::new(defaults),
            listeners: Listeners::new(),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

/// Sends one kind of event
pub struct Emitter<P: ChannelPool> {
    courier: Courier<P>,
    defaults: RwLock<EmissionOptions>,
    listeners: Listeners,
}

impl<P: ChannelPool> Emitter<P> {
    /// Change the default options; later sends use the merged result
    pub fn options(&self, input: impl Into<OptionsInput>) -> Result<EmissionOptions> {
        let mut defaults = self.defaults.write();
        let updated = match input.into() {
            OptionsInput::Event(event) => EmissionOptions {
                event,
                ..defaults.clone()
            },
            OptionsInput::Options(options) => defaults.merge(&options),
        };
        updated.validate()?;

        *defaults = updated.clone();
        Ok(updated)
    }

    pub fn current_options(&self) -> EmissionOptions {
        self.defaults.read().clone()
    }

    /// Register an in-process listener, e.g. for [`SENT`]
    pub fn on<F>(&self, name: &str, handler: F)
    where
        F: Fn(&SentEvent) + Send + Sync + 'static,
    {
        self.listeners.on(name, handler);
    }

    /// Send `payload`, with `overrides` applied over the emitter's defaults
    ///
    /// The caller's location and the options in effect are captured when this
    /// is called, not when the returned future first runs.
    #[track_caller]
    pub fn send<'a, T>(
        &'a self,
        payload: &'a T,
        overrides: Option<EmissionOptions>,
    ) -> impl Future<Output = Result<SentEvent>> + 'a
    where
        T: Serialize + Sync + ?Sized,
    {
        let call_site = CallSite::capture();
        let options = match &overrides {
            Some(overrides) => self.defaults.read().merge(overrides),
            None => self.defaults.read().clone(),
        };

        context::ensure(self.dispatch(payload, options, call_site))
    }

    async fn dispatch<T>(
        &self,
        payload: &T,
        options: EmissionOptions,
        call_site: CallSite,
    ) -> Result<SentEvent>
    where
        T: Serialize + Sync + ?Sized,
    {
        let courier = &self.courier;
        let metrics = courier.metrics.as_ref();
        let now = Utc::now();

        options.validate().map_err(|e| self.failed(&options.event, e))?;
        let builder = EnvelopeBuilder::new(
            &courier.exchange,
            &courier.app_id,
            courier.tracer.as_ref(),
            metrics,
        );
        let (envelope, span) = builder
            .build(payload, &options, call_site, now)
            .map_err(|e| self.failed(&options.event, e))?;

        let resolver = DelayResolver::new(&courier.exchange);
        let descriptor = match resolver.resolve(&options, now) {
            Ok(descriptor) => descriptor,
            Err(e) => return Err(self.abort(span, &options.event, e)),
        };
        if let Some(descriptor) = &descriptor {
            if let Err(e) = resolver.declare(courier.pool.as_ref(), descriptor, metrics).await {
                return Err(self.abort(span, &options.event, e));
            }
        }

        let envelope = match self.route(envelope, descriptor.as_ref()).await {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.abort(span, &options.event, e)),
        };
        let origin = context::current().map_or(true, |ctx| ctx.is_origin());
        span.finish();

        // Let other queued work run between rapid-fire sends
        tokio::task::yield_now().await;

        let sent = SentEvent::from_envelope(&envelope, descriptor.as_ref(), origin);
        self.record_success(&sent, descriptor.as_ref());
        self.listeners.emit(SENT, &sent);

        Ok(sent)
    }

    /// Publish to the exchange, or park in the delay queue
    async fn route(
        &self,
        envelope: Envelope,
        descriptor: Option<&DelayQueueDescriptor>,
    ) -> Result<Envelope> {
        let exchange = self.courier.exchange.clone();
        let (envelope, queue) = match descriptor {
            Some(descriptor) => (
                envelope.deferred(descriptor),
                Some(descriptor.queue_name.clone()),
            ),
            None => (envelope, None),
        };

        with_resource(self.courier.pool.as_ref(), move |channel| {
            Box::pin(async move {
                match &queue {
                    Some(queue) => {
                        channel
                            .send_to_queue(queue, &envelope.body, &envelope.properties)
                            .await?
                    }
                    None => {
                        let Envelope { event, body, properties, .. } = &envelope;
                        channel.publish(&exchange, event, body, properties).await?
                    }
                }
                Ok(envelope)
            })
        })
        .await
    }

    fn record_success(&self, sent: &SentEvent, descriptor: Option<&DelayQueueDescriptor>) {
        let metrics = &self.courier.metrics;
        let event = sent.event_type.as_str();
        metrics.increment_event_counter(metric_names::MESSAGES_SENT_TOTAL, event, 1);
        match descriptor.map(|d| d.kind) {
            Some(DelayKind::Delay { .. }) => {
                metrics.increment_event_counter(metric_names::MESSAGES_DELAYED_TOTAL, event, 1)
            }
            Some(DelayKind::Schedule { .. }) => {
                metrics.increment_event_counter(metric_names::MESSAGES_SCHEDULED_TOTAL, event, 1)
            }
            None => {}
        }
        self.refresh_pool_gauges();

        debug!(
            event = %sent.event_type,
            message_id = %sent.event_id,
            queue = ?descriptor.map(|d| d.queue_name.as_str()),
            "Event sent"
        );
    }

    /// Close the span as failed and record the failure
    fn abort(&self, mut span: Span, event: &str, error: CourierError) -> CourierError {
        span.set_error(&error);
        span.finish();
        self.failed(event, error)
    }

    fn failed(&self, event: &str, error: CourierError) -> CourierError {
        warn!(event = %event, error = %error, "Failed to send event");
        self.courier
            .metrics
            .increment_event_counter(metric_names::SEND_FAILURES_TOTAL, event, 1);
        self.refresh_pool_gauges();
        error
    }

    fn refresh_pool_gauges(&self) {
        let stats = self.courier.pool.stats();
        let metrics = &self.courier.metrics;
        metrics.set_gauge(metric_names::POOL_CHANNELS_IN_USE, stats.in_use as u64);
        metrics.set_gauge(metric_names::POOL_CHANNELS_IDLE, stats.idle as u64);
    }
}
