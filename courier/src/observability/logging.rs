//! Structured logging setup
//!
//! Applications embedding the emitter usually want its send diagnostics at a
//! different level from their own logs, so the filter is built from a base
//! level plus an optional level for the `courier` target. `RUST_LOG`, when
//! set, replaces both.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::{ObservabilityError, ObservabilityResult};

/// Target of every event this crate logs
pub const LOG_TARGET: &str = "courier";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(LogLevel::Off),
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ObservabilityError::Logging(format!("Unknown log level '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, for local development
    Pretty,
    /// One JSON object per line, for log aggregation
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ObservabilityError::Logging(format!("Unknown log format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for everything without a more specific directive
    pub level: LogLevel,
    /// Level for the emitter's own events; `level` when unset
    pub courier_level: Option<LogLevel>,
    pub format: LogFormat,
    pub service_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            courier_level: None,
            format: LogFormat::Pretty,
            service_name: LOG_TARGET.to_string(),
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directives for this configuration, e.g. `warn,courier=debug`
    pub fn directives(&self) -> String {
        match self.courier_level {
            Some(courier) if courier != self.level => {
                format!("{},{}={}", self.level, LOG_TARGET, courier)
            }
            _ => self.level.to_string(),
        }
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> ObservabilityResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())
            .map_err(|e| ObservabilityError::Logging(e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    let installed = match config.format {
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Json => registry
            .with(layer.json().with_current_span(true).with_span_list(false))
            .try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    };
    installed.map_err(|e| ObservabilityError::Logging(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        filter = %config.directives(),
        "Logging initialized"
    );

    Ok(())
}

pub fn init_default_logging(service_name: &str) -> ObservabilityResult<()> {
    init_logging(LogConfig {
        service_name: service_name.to_string(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("off".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(" Json ".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_directives() {
        let mut config = LogConfig {
            level: LogLevel::Warn,
            ..Default::default()
        };
        assert_eq!(config.directives(), "warn");

        config.courier_level = Some(LogLevel::Debug);
        assert_eq!(config.directives(), "warn,courier=debug");
        assert!(EnvFilter::try_new(config.directives()).is_ok());

        config.courier_level = Some(LogLevel::Warn);
        assert_eq!(config.directives(), "warn");
    }
}
