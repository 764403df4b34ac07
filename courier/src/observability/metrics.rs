//! Emitter metrics
//!
//! Counters may carry an `event` label so per-event traffic can be told
//! apart; gauges are unlabelled. Snapshots render in the Prometheus text
//! exposition format.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    event: Option<String>,
}

impl SeriesKey {
    fn new(name: &str, event: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            event: event.map(str::to_string),
        }
    }

    fn render(&self) -> String {
        match &self.event {
            Some(event) => format!("{}{{event=\"{}\"}}", self.name, event.replace('"', "\\\"")),
            None => self.name.clone(),
        }
    }
}

type Series = RwLock<HashMap<SeriesKey, AtomicU64>>;

/// Apply `update` to the series for `key`, creating it at zero first
fn update_series(series: &Series, key: SeriesKey, update: impl Fn(&AtomicU64)) {
    if let Some(value) = series.read().get(&key) {
        update(value);
        return;
    }
    update(series.write().entry(key).or_default());
}

fn collect(series: &Series) -> BTreeMap<String, u64> {
    series
        .read()
        .iter()
        .map(|(key, value)| (key.render(), value.load(Ordering::Relaxed)))
        .collect()
}

/// Counter and gauge registry shared by the emitters of one courier
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Series,
    gauges: Series,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, value: u64) {
        update_series(&self.counters, SeriesKey::new(name, None), |counter| {
            counter.fetch_add(value, Ordering::Relaxed);
        });
    }

    /// Increment the series of `name` labelled with `event`
    pub fn increment_event_counter(&self, name: &str, event: &str, value: u64) {
        update_series(&self.counters, SeriesKey::new(name, Some(event)), |counter| {
            counter.fetch_add(value, Ordering::Relaxed);
        });
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        update_series(&self.gauges, SeriesKey::new(name, None), |gauge| {
            gauge.store(value, Ordering::Relaxed);
        });
    }

    /// Total of `name` across all labels, `None` if never recorded
    pub fn get_counter(&self, name: &str) -> Option<u64> {
        let counters = self.counters.read();
        let mut matching = counters
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, value)| value.load(Ordering::Relaxed))
            .peekable();
        matching.peek()?;
        Some(matching.sum())
    }

    pub fn get_event_counter(&self, name: &str, event: &str) -> Option<u64> {
        self.counters
            .read()
            .get(&SeriesKey::new(name, Some(event)))
            .map(|value| value.load(Ordering::Relaxed))
    }

    pub fn get_gauge(&self, name: &str) -> Option<u64> {
        self.gauges
            .read()
            .get(&SeriesKey::new(name, None))
            .map(|value| value.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: collect(&self.counters),
            gauges: collect(&self.gauges),
        }
    }
}

/// Point-in-time copy of every series, keyed by rendered series name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Prometheus text exposition of the snapshot
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (kind, series) in [("counter", &self.counters), ("gauge", &self.gauges)] {
            let mut current = None;
            for (key, value) in series {
                let name = key.split('{').next().unwrap_or(key);
                if current != Some(name) {
                    let _ = writeln!(out, "# TYPE {} {}", name, kind);
                    current = Some(name);
                }
                let _ = writeln!(out, "{} {}", key, value);
            }
        }
        out
    }
}

/// Metric names recorded by the emitter
pub mod metric_names {
    pub const MESSAGES_SENT_TOTAL: &str = "messages_sent_total";
    pub const MESSAGES_DELAYED_TOTAL: &str = "messages_delayed_total";
    pub const MESSAGES_SCHEDULED_TOTAL: &str = "messages_scheduled_total";
    pub const SEND_FAILURES_TOTAL: &str = "send_failures_total";
    pub const SERIALIZATION_WARNINGS_TOTAL: &str = "serialization_warnings_total";
    pub const TOLERATED_CONFLICTS_TOTAL: &str = "tolerated_conflicts_total";

    pub const POOL_CHANNELS_IN_USE: &str = "pool_channels_in_use";
    pub const POOL_CHANNELS_IDLE: &str = "pool_channels_idle";
}
