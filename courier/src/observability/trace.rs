//! Distributed tracing for emitted messages
//!
//! Spans are reported through `tracing` and propagated to consumers in the
//! message's context header using the W3C trace context format
//! (`traceparent`, `tracestate`).

use std::collections::HashMap;
use std::time::Instant;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use tracing::{debug, warn};

/// Key used in propagation carriers
pub const TRACEPARENT: &str = "traceparent";

/// Propagation carrier written into message headers
pub type Carrier = HashMap<String, String>;

/// Identity of a span, enough to resume a trace elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub sampled: bool,
}

impl SpanContext {
    /// Start a new trace
    pub fn new_root() -> Self {
        let ids = RandomIdGenerator::default();
        Self {
            trace_id: ids.new_trace_id(),
            span_id: ids.new_span_id(),
            sampled: true,
        }
    }

    /// New span id within the same trace
    pub fn new_child(&self) -> Self {
        Self {
            span_id: RandomIdGenerator::default().new_span_id(),
            ..*self
        }
    }

    /// Write this context into `carrier` as W3C trace context headers
    pub fn inject_into(&self, carrier: &mut Carrier) {
        let flags = if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        let remote = opentelemetry::trace::SpanContext::new(
            self.trace_id,
            self.span_id,
            flags,
            true,
            TraceState::default(),
        );
        let cx = opentelemetry::Context::new().with_remote_span_context(remote);
        TraceContextPropagator::new().inject_context(&cx, carrier);
    }

    /// Read a context back out of W3C trace context headers
    pub fn extract_from(carrier: &Carrier) -> Option<Self> {
        let cx = TraceContextPropagator::new().extract(carrier);
        let span = cx.span();
        let remote = span.span_context();
        if !remote.is_valid() {
            return None;
        }

        Some(Self {
            trace_id: remote.trace_id(),
            span_id: remote.span_id(),
            sampled: remote.is_sampled(),
        })
    }

    pub fn to_traceparent(&self) -> String {
        let mut carrier = Carrier::new();
        self.inject_into(&mut carrier);
        carrier.remove(TRACEPARENT).unwrap_or_default()
    }

    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut carrier = Carrier::new();
        carrier.insert(TRACEPARENT.to_string(), value.trim().to_string());
        Self::extract_from(&carrier)
    }
}

/// Options for [`Tracer::start_span`]
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    pub tags: Vec<(String, String)>,
    pub child_of: Option<SpanContext>,
}

impl SpanOptions {
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn child_of(mut self, parent: Option<SpanContext>) -> Self {
        self.child_of = parent;
        self
    }
}

/// Tracer collaborator
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, options: SpanOptions) -> Span;

    /// Write `context` into `carrier`
    fn inject(&self, context: &SpanContext, carrier: &mut Carrier);

    /// Read a span context back out of `carrier`
    fn extract(&self, carrier: &Carrier) -> Option<SpanContext>;
}

/// An open span; closed by [`Span::finish`] or on drop
#[derive(Debug)]
pub struct Span {
    name: String,
    context: SpanContext,
    parent: Option<SpanContext>,
    tags: Vec<(String, String)>,
    inner: tracing::Span,
    started: Instant,
    error: Option<String>,
    finished: bool,
}

impl Span {
    pub fn new(name: &str, options: SpanOptions, inner: tracing::Span) -> Self {
        let context = match &options.child_of {
            Some(parent) => parent.new_child(),
            None => SpanContext::new_root(),
        };

        Self {
            name: name.to_string(),
            context,
            parent: options.child_of,
            tags: options.tags,
            inner,
            started: Instant::now(),
            error: None,
            finished: false,
        }
    }

    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn parent(&self) -> Option<&SpanContext> {
        self.parent.as_ref()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `tracing` span backing this span
    pub fn tracing_span(&self) -> &tracing::Span {
        &self.inner
    }

    /// Mark the span as failed; it still needs to be finished
    pub fn set_error(&mut self, error: impl ToString) {
        self.error = Some(error.to_string());
    }

    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let _entered = self.inner.enter();
        let duration_ms = self.started.elapsed().as_millis() as u64;
        match &self.error {
            Some(error) => warn!(
                span = %self.name,
                trace_id = %self.context.trace_id,
                duration_ms,
                error = %error,
                "Span finished with error"
            ),
            None => debug!(
                span = %self.name,
                trace_id = %self.context.trace_id,
                duration_ms,
                "Span finished"
            ),
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.close();
    }
}

/// Tracer that reports spans through `tracing` and propagates W3C trace context
#[derive(Debug, Clone, Default)]
pub struct W3cTracer;

impl Tracer for W3cTracer {
    fn start_span(&self, name: &str, options: SpanOptions) -> Span {
        let inner = tracing::info_span!(
            "courier_span",
            otel.name = %name,
            trace_id = tracing::field::Empty,
            parent_span = ?options.child_of.as_ref().map(|p| p.span_id.to_string()),
        );
        let span = Span::new(name, options, inner);
        span.inner
            .record("trace_id", tracing::field::display(span.context.trace_id));
        span
    }

    fn inject(&self, context: &SpanContext, carrier: &mut Carrier) {
        context.inject_into(carrier);
    }

    fn extract(&self, carrier: &Carrier) -> Option<SpanContext> {
        SpanContext::extract_from(carrier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_round_trip() {
        let context = SpanContext::new_root();
        let parsed = SpanContext::from_traceparent(&context.to_traceparent()).unwrap();
        assert_eq!(parsed, context);
    }

    #[test]
    fn test_traceparent_format() {
        let context = SpanContext {
            trace_id: TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            span_id: SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            sampled: true,
        };

        assert_eq!(
            context.to_traceparent(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
    }

    #[test]
    fn test_traceparent_rejects_malformed() {
        assert!(SpanContext::from_traceparent("").is_none());
        assert!(SpanContext::from_traceparent("not-a-traceparent").is_none());
        assert!(SpanContext::from_traceparent(
            "00-zzf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        )
        .is_none());
        assert!(SpanContext::from_traceparent(
            "00-00000000000000000000000000000000-0000000000000000-01"
        )
        .is_none());
    }

    #[test]
    fn test_child_span_shares_trace() {
        let tracer = W3cTracer;
        let parent = SpanContext::new_root();

        let span = tracer.start_span(
            "emit order.created",
            SpanOptions::default()
                .tag("span.kind", "producer")
                .child_of(Some(parent)),
        );

        assert_eq!(span.context().trace_id, parent.trace_id);
        assert_ne!(span.context().span_id, parent.span_id);
        assert_eq!(span.parent(), Some(&parent));
        assert_eq!(span.tag("span.kind"), Some("producer"));
        span.finish();
    }

    #[test]
    fn test_inject_extract() {
        let tracer = W3cTracer;
        let context = SpanContext::new_root();
        let mut carrier = Carrier::new();

        tracer.inject(&context, &mut carrier);
        assert!(carrier.contains_key(TRACEPARENT));
        assert_eq!(tracer.extract(&carrier), Some(context));
        assert_eq!(tracer.extract(&Carrier::new()), None);
    }
}
