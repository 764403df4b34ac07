//! Emission options
//!
//! Callers describe a send with an [`OptionsInput`]: either a bare event name
//! or a full [`EmissionOptions`]. Everything is normalized into one
//! `EmissionOptions` before the send starts.

pub mod duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{CourierError, Result};

/// Highest message priority a broker queue accepts
pub const MAX_PRIORITY: u8 = 10;

/// Relative delivery delay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delay {
    Millis(i64),
    /// Human duration such as `"5m"` or `"1h 30m"`
    Text(String),
}

impl Delay {
    /// `Ok(None)` for a zero delay, an error for anything not a positive duration
    pub fn millis(&self) -> Result<Option<u64>> {
        match self {
            Delay::Millis(0) => Ok(None),
            Delay::Millis(ms) if *ms > 0 => Ok(Some(*ms as u64)),
            Delay::Millis(ms) => Err(CourierError::Validation(format!(
                "Delay must be a positive duration, got {}ms",
                ms
            ))),
            Delay::Text(text) => duration::parse_millis(text).map(|ms| (ms > 0).then_some(ms)),
        }
    }
}

impl From<u64> for Delay {
    fn from(ms: u64) -> Self {
        Delay::Millis(ms.min(i64::MAX as u64) as i64)
    }
}

impl From<&str> for Delay {
    fn from(text: &str) -> Self {
        Delay::Text(text.to_string())
    }
}

impl From<std::time::Duration> for Delay {
    fn from(duration: std::time::Duration) -> Self {
        Delay::Millis(duration.as_millis().min(i64::MAX as u128) as i64)
    }
}

/// Absolute delivery time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schedule {
    At(DateTime<Utc>),
    EpochMillis(i64),
    /// RFC 3339 timestamp
    Text(String),
}

impl Schedule {
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        match self {
            Schedule::At(at) => Ok(*at),
            Schedule::EpochMillis(ms) => Utc.timestamp_millis_opt(*ms).single().ok_or_else(|| {
                CourierError::Validation(format!("Schedule {}ms is not a valid point in time", ms))
            }),
            Schedule::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| {
                    CourierError::Validation(format!("Invalid schedule '{}': {}", text, e))
                }),
        }
    }
}

impl From<DateTime<Utc>> for Schedule {
    fn from(at: DateTime<Utc>) -> Self {
        Schedule::At(at)
    }
}

impl From<&str> for Schedule {
    fn from(text: &str) -> Self {
        Schedule::Text(text.to_string())
    }
}

/// Delivery timing; a send is either delayed or scheduled, never both
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timing {
    Delay(Delay),
    Schedule(Schedule),
}

/// Normalized options for one emitter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionOptions {
    pub event: String,
    pub priority: Option<u8>,
    pub timing: Option<Timing>,
}

impl EmissionOptions {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Delay delivery; clears any schedule
    pub fn delay(mut self, delay: impl Into<Delay>) -> Self {
        self.timing = Some(Timing::Delay(delay.into()));
        self
    }

    /// Deliver at an absolute time; clears any delay
    pub fn schedule(mut self, schedule: impl Into<Schedule>) -> Self {
        self.timing = Some(Timing::Schedule(schedule.into()));
        self
    }

    pub fn delay_value(&self) -> Option<&Delay> {
        match &self.timing {
            Some(Timing::Delay(delay)) => Some(delay),
            _ => None,
        }
    }

    pub fn schedule_value(&self) -> Option<&Schedule> {
        match &self.timing {
            Some(Timing::Schedule(schedule)) => Some(schedule),
            _ => None,
        }
    }

    /// Per-send view: values set in `overrides` win. An empty event name in
    /// `overrides` keeps this emitter's event.
    pub fn merge(&self, overrides: &EmissionOptions) -> EmissionOptions {
        EmissionOptions {
            event: if overrides.event.is_empty() {
                self.event.clone()
            } else {
                overrides.event.clone()
            },
            priority: overrides.priority.or(self.priority),
            timing: overrides.timing.clone().or_else(|| self.timing.clone()),
        }
    }

    /// Check everything that can be checked without a clock
    pub fn validate(&self) -> Result<()> {
        if self.event.trim().is_empty() {
            return Err(CourierError::Validation("Event name must not be empty".to_string()));
        }

        validate_priority(self.priority)
    }
}

pub fn validate_priority(priority: Option<u8>) -> Result<()> {
    match priority {
        Some(p) if p > MAX_PRIORITY => Err(CourierError::Validation(format!(
            "Priority must be between 0 and {}, got {}",
            MAX_PRIORITY, p
        ))),
        _ => Ok(()),
    }
}

/// Options as supplied by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsInput {
    Event(String),
    Options(EmissionOptions),
}

impl OptionsInput {
    pub fn into_options(self) -> EmissionOptions {
        match self {
            OptionsInput::Event(event) => EmissionOptions::new(event),
            OptionsInput::Options(options) => options,
        }
    }
}

impl From<&str> for OptionsInput {
    fn from(event: &str) -> Self {
        OptionsInput::Event(event.to_string())
    }
}

impl From<String> for OptionsInput {
    fn from(event: String) -> Self {
        OptionsInput::Event(event)
    }
}

impl From<EmissionOptions> for OptionsInput {
    fn from(options: EmissionOptions) -> Self {
        OptionsInput::Options(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_and_schedule_exclusive() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        let options = EmissionOptions::new("order.created").delay("5m").schedule(at);
        assert_eq!(options.delay_value(), None);
        assert_eq!(options.schedule_value(), Some(&Schedule::At(at)));

        let options = options.delay(1000u64);
        assert_eq!(options.schedule_value(), None);
        assert_eq!(options.delay_value(), Some(&Delay::Millis(1000)));
    }

    #[test]
    fn test_delay_millis() {
        assert_eq!(Delay::Text("5m".to_string()).millis().unwrap(), Some(300_000));
        assert_eq!(Delay::Millis(0).millis().unwrap(), None);
        assert_eq!(Delay::Millis(250).millis().unwrap(), Some(250));
        assert!(Delay::Millis(-5).millis().is_err());
        assert!(Delay::Text("soon".to_string()).millis().is_err());
    }

    #[test]
    fn test_schedule_timestamp() {
        let parsed = Schedule::Text("2030-01-01T00:00:00Z".to_string()).timestamp().unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            Schedule::EpochMillis(parsed.timestamp_millis()).timestamp().unwrap(),
            parsed
        );
        assert!(Schedule::Text("next tuesday".to_string()).timestamp().is_err());
        assert!(Schedule::EpochMillis(i64::MAX).timestamp().is_err());
    }

    #[test]
    fn test_priority_bounds() {
        assert!(EmissionOptions::new("a").priority(0).validate().is_ok());
        assert!(EmissionOptions::new("a").priority(10).validate().is_ok());
        assert!(matches!(
            EmissionOptions::new("a").priority(11).validate(),
            Err(CourierError::Validation(_))
        ));
        assert!(EmissionOptions::new("  ").validate().is_err());
    }

    #[test]
    fn test_merge_overrides() {
        let base = EmissionOptions::new("order.created").priority(2).delay("1m");

        let merged = base.merge(&EmissionOptions::default().priority(7));
        assert_eq!(merged.event, "order.created");
        assert_eq!(merged.priority, Some(7));
        assert_eq!(merged.delay_value(), Some(&Delay::Text("1m".to_string())));

        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let merged = base.merge(&EmissionOptions::default().schedule(at));
        assert_eq!(merged.delay_value(), None);
        assert_eq!(merged.schedule_value(), Some(&Schedule::At(at)));
    }

    #[test]
    fn test_input_shorthand() {
        let options = OptionsInput::from("user.registered").into_options();
        assert_eq!(options, EmissionOptions::new("user.registered"));
    }
}
