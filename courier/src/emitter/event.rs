use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delay::{DelayKind, DelayQueueDescriptor};
use crate::envelope::Envelope;
use crate::observability::Carrier;

/// Which side of the broker an event was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    /// Received by a consumer
    Entry,
    /// Sent by a producer
    Exit,
}

/// Record of a completed send, handed to listeners and returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentEvent {
    pub event_id: String,
    pub event_type: String,
    /// Producer identity
    pub resource: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Source location of the send
    pub trace: String,
    pub context: Carrier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<DateTime<Utc>>,
    pub flow: Flow,
    /// True when the send started a new trace
    pub origin: bool,
}

impl SentEvent {
    pub fn from_envelope(
        envelope: &Envelope,
        descriptor: Option<&DelayQueueDescriptor>,
        origin: bool,
    ) -> Self {
        let properties = &envelope.properties;
        let (delay, schedule) = match descriptor.map(|d| d.kind) {
            Some(DelayKind::Delay { millis }) => (Some(millis), None),
            Some(DelayKind::Schedule { at }) => (None, Some(at)),
            None => (None, None),
        };

        Self {
            event_id: properties.message_id.clone(),
            event_type: envelope.event.clone(),
            resource: properties.app_id.clone(),
            data: envelope.data.clone(),
            timestamp: Utc
                .timestamp_millis_opt(properties.timestamp)
                .single()
                .unwrap_or_else(Utc::now),
            trace: properties.headers.trace.clone(),
            context: properties.headers.context.clone(),
            priority: properties.priority,
            delay,
            schedule,
            flow: Flow::Exit,
            origin,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.delay.is_some() || self.schedule.is_some()
    }
}
