//! Configuration for the emitter
//!
//! Values come from the environment (and a `.env` file when present) with
//! defaults for everything:
//! - `COURIER_EXCHANGE`: exchange events are published to
//! - `COURIER_APP_ID`: producer identity stamped on every message
//! - `COURIER_POOL_MAX_SIZE`: channels the pool may hold open
//! - `COURIER_LOG_LEVEL` / `COURIER_LOG_FORMAT`: logging setup
//! - `COURIER_LOG_EMITTER_LEVEL`: level for the emitter's own diagnostics

use anyhow::{Context, Result};
use std::env;

use crate::observability::{LogConfig, LogFormat, LogLevel};
use crate::pool::PoolConfig;

pub const DEFAULT_EXCHANGE: &str = "courier";

#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub exchange: String,
    pub app_id: String,
    pub pool: PoolConfig,
    pub logging: LogConfig,
}

impl CourierConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let app_id = env::var("COURIER_APP_ID").unwrap_or_else(|_| DEFAULT_EXCHANGE.to_string());
        let logging = LogConfig {
            level: env::var("COURIER_LOG_LEVEL")
                .unwrap_or_else(|_| "info".to_string())
                .parse::<LogLevel>()
                .context("Invalid COURIER_LOG_LEVEL")?,
            format: env::var("COURIER_LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .parse::<LogFormat>()
                .context("Invalid COURIER_LOG_FORMAT")?,
            courier_level: env::var("COURIER_LOG_EMITTER_LEVEL")
                .ok()
                .map(|level| level.parse::<LogLevel>())
                .transpose()
                .context("Invalid COURIER_LOG_EMITTER_LEVEL")?,
            service_name: app_id.clone(),
        };

        let config = Self {
            exchange: env::var("COURIER_EXCHANGE").unwrap_or_else(|_| DEFAULT_EXCHANGE.to_string()),
            app_id,
            pool: PoolConfig::from_env(),
            logging,
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.trim().is_empty() {
            anyhow::bail!("Exchange name cannot be empty");
        }
        if self.app_id.trim().is_empty() {
            anyhow::bail!("App id cannot be empty");
        }
        self.pool.validate().context("Invalid pool configuration")?;
        Ok(())
    }
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            app_id: DEFAULT_EXCHANGE.to_string(),
            pool: PoolConfig::default(),
            logging: LogConfig::default(),
        }
    }
}
