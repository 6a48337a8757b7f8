//! Runtime settings.
//!
//! Layered lowest to highest: built-in defaults, optional TOML file,
//! `BAZAAR_*` environment variables, then `DATABASE_URL`.

use std::env;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::engine::types::MAX_DEPTH;
use crate::market_data::adapters::hypixel::DEFAULT_URL;

/// What the scheduler does when a cycle hits a storage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFailurePolicy {
    /// Log and wait for the next tick.
    #[default]
    Continue,
    /// Log and return the error from the run loop.
    Stop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: Option<String>,
    pub source_url: String,
    pub fetch_interval_secs: u64,
    pub candle_interval_minutes: u64,
    pub fetch_timeout_secs: u64,
    pub storage_timeout_secs: u64,
    pub min_price: f64,
    pub max_depth: usize,
    pub max_connections: u32,
    pub log_filter: String,
    pub on_storage_failure: StorageFailurePolicy,
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("source_url", DEFAULT_URL)?
        .set_default("fetch_interval_secs", 60_i64)?
        .set_default("candle_interval_minutes", 1_i64)?
        .set_default("fetch_timeout_secs", 10_i64)?
        .set_default("storage_timeout_secs", 30_i64)?
        .set_default("min_price", 0.7_f64)?
        .set_default("max_depth", MAX_DEPTH as i64)?
        .set_default("max_connections", 5_i64)?
        .set_default("log_filter", "info")?
        .set_default("on_storage_failure", "continue")
}

impl Settings {
    /// Load settings; a missing file at `path` is not an error.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let cfg = with_defaults()?
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("BAZAAR").try_parsing(true))
            .set_override_option("database_url", env::var("DATABASE_URL").ok())?
            .build()?;
        Self::finish(cfg)
    }

    fn finish(cfg: Config) -> Result<Self, ConfigError> {
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("fetch_interval_secs", self.fetch_interval_secs),
            ("candle_interval_minutes", self.candle_interval_minutes),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("storage_timeout_secs", self.storage_timeout_secs),
            ("max_connections", u64::from(self.max_connections)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Message(format!("{} must be greater than zero", key)));
            }
        }
        // keeps the lookback window comfortably inside chrono's range
        if self.candle_interval_minutes > 60 * 24 * 365 {
            return Err(ConfigError::Message("candle_interval_minutes must be at most one year".into()));
        }
        if !(1..=MAX_DEPTH).contains(&self.max_depth) {
            return Err(ConfigError::Message(format!("max_depth must be within 1..={}", MAX_DEPTH)));
        }
        if !self.min_price.is_finite() || self.min_price < 0.0 {
            return Err(ConfigError::Message("min_price must be a non-negative number".into()));
        }
        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn candle_interval(&self) -> Duration {
        Duration::from_secs(self.candle_interval_minutes * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn min_price_decimal(&self) -> Decimal {
        // validate() guarantees a finite value
        Decimal::from_f64(self.min_price).unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> Result<Settings, ConfigError> {
        let cfg = with_defaults()
            .unwrap()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Settings::finish(cfg)
    }

    #[test]
    fn test_defaults() {
        let s = from_toml("").unwrap();
        assert_eq!(s.fetch_interval(), Duration::from_secs(60));
        assert_eq!(s.candle_interval(), Duration::from_secs(60));
        assert_eq!(s.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(s.max_depth, 5);
        assert_eq!(s.min_price_decimal(), Decimal::new(7, 1));
        assert_eq!(s.on_storage_failure, StorageFailurePolicy::Continue);
        assert_eq!(s.source_url, DEFAULT_URL);
        assert!(s.database_url.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let s = from_toml(
            r#"
            database_url = "postgres://localhost/bazaar_db"
            candle_interval_minutes = 5
            on_storage_failure = "stop"
            "#,
        )
        .unwrap();
        assert_eq!(s.candle_interval(), Duration::from_secs(300));
        assert_eq!(s.on_storage_failure, StorageFailurePolicy::Stop);
        assert_eq!(s.database_url.as_deref(), Some("postgres://localhost/bazaar_db"));
    }

    #[test]
    fn test_rejects_zero_interval_and_bad_depth() {
        assert!(from_toml("fetch_interval_secs = 0").is_err());
        assert!(from_toml("max_depth = 6").is_err());
        assert!(from_toml("min_price = -1.0").is_err());
    }
}
