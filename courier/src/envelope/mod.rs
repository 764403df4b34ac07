//! Outgoing message envelopes
//!
//! An [`Envelope`] is the body plus transport metadata of one send attempt.
//! It is built once, before any I/O, and only annotated with delay or
//! schedule headers afterwards.

use std::panic::Location;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::broker::{MessageHeaders, MessageProperties};
use crate::delay::{DelayKind, DelayQueueDescriptor};
use crate::observability::{metric_names, MetricsCollector, Span, SpanOptions, Tracer};
use crate::options::{validate_priority, EmissionOptions};
use crate::Result;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Longest payload rendering attached to a span tag
const MAX_SPAN_PAYLOAD_LEN: usize = 1024;

/// A message ready to hand to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    /// The payload as it was encoded; `Value::Null` if encoding failed
    pub data: Value,
    /// Encoded body bytes
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Envelope {
    pub fn message_id(&self) -> &str {
        &self.properties.message_id
    }

    pub fn timestamp(&self) -> i64 {
        self.properties.timestamp
    }

    /// Copy with the delivery headers for `descriptor`
    ///
    /// Delayed messages carry the delay; the queue applies the TTL. Scheduled
    /// messages carry the target time and expire individually.
    pub fn deferred(&self, descriptor: &DelayQueueDescriptor) -> Envelope {
        let mut deferred = self.clone();
        match descriptor.kind {
            DelayKind::Delay { millis } => {
                deferred.properties.headers.delay = Some(millis);
            }
            DelayKind::Schedule { at } => {
                deferred.properties.headers.scheduled = Some(at.timestamp_millis());
                deferred.properties.expiration = Some(descriptor.expiration_millis);
            }
        }
        deferred
    }
}

/// Source location of the code that asked for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    location: &'static Location<'static>,
}

impl CallSite {
    /// Capture the caller of the enclosing `#[track_caller]` function
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}",
            self.location.file(),
            self.location.line(),
            self.location.column()
        )
    }
}

/// Builds envelopes for one exchange and producer
pub struct EnvelopeBuilder<'a> {
    exchange: &'a str,
    app_id: &'a str,
    tracer: &'a dyn Tracer,
    metrics: &'a MetricsCollector,
}

impl<'a> EnvelopeBuilder<'a> {
    pub fn new(
        exchange: &'a str,
        app_id: &'a str,
        tracer: &'a dyn Tracer,
        metrics: &'a MetricsCollector,
    ) -> Self {
        Self {
            exchange,
            app_id,
            tracer,
            metrics,
        }
    }

    /// Build the envelope for one send and open its producer span
    ///
    /// The span is a child of the active context's span, if any, and its
    /// propagation carrier goes into the context header.
    pub fn build<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: &EmissionOptions,
        call_site: CallSite,
        now: DateTime<Utc>,
    ) -> Result<(Envelope, Span)> {
        validate_priority(options.priority)?;

        let (data, body) = self.encode(payload, &options.event);

        let parent = crate::context::current().and_then(|ctx| ctx.span().copied());
        let span = self.tracer.start_span(
            &format!("emit {}", options.event),
            SpanOptions::default()
                .child_of(parent)
                .tag("message_bus.destination", format!("{}/{}", self.exchange, options.event))
                .tag("span.kind", "producer")
                .tag("data", render_for_span(&data)),
        );

        let mut headers = MessageHeaders {
            trace: call_site.render(),
            ..Default::default()
        };
        self.tracer.inject(span.context(), &mut headers.context);

        let envelope = Envelope {
            event: options.event.clone(),
            data,
            body,
            properties: MessageProperties {
                message_id: Uuid::new_v4().to_string(),
                app_id: self.app_id.to_string(),
                timestamp: now.timestamp_millis(),
                headers,
                content_type: CONTENT_TYPE_JSON.to_string(),
                persistent: true,
                priority: options.priority,
                expiration: None,
            },
        };

        Ok((envelope, span))
    }

    /// Encode the payload, substituting null when it cannot be represented
    fn encode<T: Serialize + ?Sized>(&self, payload: &T, event: &str) -> (Value, Vec<u8>) {
        let encoded = serde_json::to_value(payload)
            .and_then(|value| serde_json::to_vec(&value).map(|body| (value, body)));

        match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(
                    event = %event,
                    error = %e,
                    "Payload could not be serialized, sending null instead"
                );
                self.metrics
                    .increment_event_counter(metric_names::SERIALIZATION_WARNINGS_TOTAL, event, 1);
                (Value::Null, b"null".to_vec())
            }
        }
    }
}

fn render_for_span(data: &Value) -> String {
    let mut rendered = data.to_string();
    if rendered.len() > MAX_SPAN_PAYLOAD_LEN {
        let mut cut = MAX_SPAN_PAYLOAD_LEN;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        rendered.truncate(cut);
        rendered.push_str("...");
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{run_and_return, ExecutionContext};
    use crate::observability::{SpanContext, W3cTracer, TRACEPARENT};
    use crate::CourierError;
    use serde::Serializer;
    use serde_json::json;
    use std::collections::HashMap;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize a handle"))
        }
    }

    fn builder<'a>(tracer: &'a W3cTracer, metrics: &'a MetricsCollector) -> EnvelopeBuilder<'a> {
        EnvelopeBuilder::new("courier", "orders-service", tracer, metrics)
    }

    #[test]
    fn test_build_sets_metadata() {
        let tracer = W3cTracer;
        let metrics = MetricsCollector::new();
        let now = Utc::now();
        let options = EmissionOptions::new("order.created").priority(3);

        let (envelope, span) = builder(&tracer, &metrics)
            .build(&json!({"id": 1}), &options, CallSite::capture(), now)
            .unwrap();

        assert_eq!(envelope.event, "order.created");
        assert_eq!(envelope.data, json!({"id": 1}));
        assert_eq!(envelope.body, br#"{"id":1}"#.to_vec());
        assert_eq!(envelope.properties.app_id, "orders-service");
        assert_eq!(envelope.properties.priority, Some(3));
        assert_eq!(envelope.properties.timestamp, now.timestamp_millis());
        assert!(envelope.properties.persistent);
        assert!(Uuid::parse_str(envelope.message_id()).is_ok());
        assert!(envelope.properties.headers.trace.contains("envelope"));
        assert_eq!(
            envelope.properties.headers.context.get(TRACEPARENT),
            Some(&span.context().to_traceparent())
        );
        assert_eq!(span.tag("span.kind"), Some("producer"));
        assert_eq!(span.tag("message_bus.destination"), Some("courier/order.created"));
    }

    #[test]
    fn test_fresh_message_id_per_build() {
        let tracer = W3cTracer;
        let metrics = MetricsCollector::new();
        let options = EmissionOptions::new("order.created");
        let builder = builder(&tracer, &metrics);

        let (first, _) = builder.build(&(), &options, CallSite::capture(), Utc::now()).unwrap();
        let (second, _) = builder.build(&(), &options, CallSite::capture(), Utc::now()).unwrap();

        assert_ne!(first.message_id(), second.message_id());
    }

    #[test]
    fn test_invalid_priority_fails() {
        let tracer = W3cTracer;
        let metrics = MetricsCollector::new();
        let options = EmissionOptions::new("order.created").priority(11);

        let result =
            builder(&tracer, &metrics).build(&json!({}), &options, CallSite::capture(), Utc::now());
        assert!(matches!(result, Err(CourierError::Validation(_))));
    }

    #[test]
    fn test_unserializable_payload_becomes_null() {
        let tracer = W3cTracer;
        let metrics = MetricsCollector::new();
        let options = EmissionOptions::new("order.created");

        let (envelope, _) = builder(&tracer, &metrics)
            .build(&Unserializable, &options, CallSite::capture(), Utc::now())
            .unwrap();

        assert_eq!(envelope.data, Value::Null);
        assert_eq!(envelope.body, b"null".to_vec());
        assert_eq!(metrics.get_counter(metric_names::SERIALIZATION_WARNINGS_TOTAL), Some(1));
    }

    #[test]
    fn test_non_string_map_keys_become_null() {
        let tracer = W3cTracer;
        let metrics = MetricsCollector::new();
        let options = EmissionOptions::new("order.created");
        let mut payload = HashMap::new();
        payload.insert((1, 2), "tuple keys");

        let (envelope, _) = builder(&tracer, &metrics)
            .build(&payload, &options, CallSite::capture(), Utc::now())
            .unwrap();

        assert_eq!(envelope.body, b"null".to_vec());
    }

    #[tokio::test]
    async fn test_span_is_child_of_context_span() {
        let tracer = W3cTracer;
        let metrics = MetricsCollector::new();
        let parent = SpanContext::new_root();
        let options = EmissionOptions::new("order.created");

        let span = run_and_return(ExecutionContext::continuation(parent), async {
            let (_, span) = builder(&tracer, &metrics)
                .build(&json!(null), &options, CallSite::capture(), Utc::now())
                .unwrap();
            span
        })
        .await;

        assert_eq!(span.parent(), Some(&parent));
        assert_eq!(span.context().trace_id, parent.trace_id);
    }

    #[test]
    fn test_deferred_headers() {
        let tracer = W3cTracer;
        let metrics = MetricsCollector::new();
        let now = Utc::now();
        let options = EmissionOptions::new("order.created");
        let (envelope, _) = builder(&tracer, &metrics)
            .build(&json!({}), &options, CallSite::capture(), now)
            .unwrap();

        let delayed = envelope.deferred(&DelayQueueDescriptor {
            queue_name: "d:courier:order.created:5000".to_string(),
            expiration_millis: 5000,
            kind: DelayKind::Delay { millis: 5000 },
            queue_options: Default::default(),
        });
        assert_eq!(delayed.properties.headers.delay, Some(5000));
        assert_eq!(delayed.properties.expiration, None);

        let at = now + chrono::Duration::seconds(30);
        let scheduled = envelope.deferred(&DelayQueueDescriptor {
            queue_name: format!("d:courier:order.created:{}", at.timestamp_millis()),
            expiration_millis: 30_000,
            kind: DelayKind::Schedule { at },
            queue_options: Default::default(),
        });
        assert_eq!(scheduled.properties.headers.scheduled, Some(at.timestamp_millis()));
        assert_eq!(scheduled.properties.expiration, Some(30_000));
        assert_eq!(scheduled.message_id(), envelope.message_id());
    }
}
