use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const MIN_INTERVAL_SECS: f64 = 0.5;
pub const MIN_TEXT_LIMIT: usize = 10;

pub const DEFAULT_INTERVAL_SECS: f64 = 3.0;
pub const DEFAULT_RECENCY_WINDOW_SECS: u64 = 120;
pub const DEFAULT_REBUILD_PERIOD_SECS: u64 = 120;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_TEXT_LIMIT: usize = 50;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DEDUP_RETENTION_SECS: u64 = 300;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid account entry `{0}`, expected server,user,secret")]
    AccountFormat(String),
    #[error("interval must be at least 0.5 seconds, got {0}")]
    Interval(f64),
    #[error("text limit must be at least 10 characters, got {0}")]
    TextLimit(usize),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid settings: {0}")]
    Parse(String),
}

/// Tunables for the polling loop. Every field has a default, so a host may supply
/// any subset of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub interval_secs: f64,
    pub recency_window_secs: u64,
    pub rebuild_period_secs: u64,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub text_limit: usize,
    pub stop_timeout_secs: u64,
    pub dedup_retention_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            recency_window_secs: DEFAULT_RECENCY_WINDOW_SECS,
            rebuild_period_secs: DEFAULT_REBUILD_PERIOD_SECS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            text_limit: DEFAULT_TEXT_LIMIT,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            dedup_retention_secs: DEFAULT_DEDUP_RETENTION_SECS,
        }
    }
}

impl Settings {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_interval(self.interval_secs)?;
        check_text_limit(self.text_limit)?;
        for (name, value) in [
            ("recency window", self.recency_window_secs),
            ("rebuild period", self.rebuild_period_secs),
            ("timeout", self.timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn rebuild_period(&self) -> Duration {
        Duration::from_secs(self.rebuild_period_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }
}

pub fn check_interval(secs: f64) -> Result<(), ConfigError> {
    if !secs.is_finite() || secs < MIN_INTERVAL_SECS {
        return Err(ConfigError::Interval(secs));
    }
    Ok(())
}

pub fn check_text_limit(limit: usize) -> Result<(), ConfigError> {
    if limit < MIN_TEXT_LIMIT {
        return Err(ConfigError::TextLimit(limit));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.recency_window(), Duration::from_secs(120));
        assert_eq!(settings.rebuild_period(), Duration::from_secs(120));
        assert_eq!(settings.timeout(), Duration::from_secs(30));
        assert_eq!(settings.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn interval_floor_is_half_a_second() {
        assert!(matches!(check_interval(0.3), Err(ConfigError::Interval(_))));
        assert!(check_interval(f64::NAN).is_err());
        assert!(check_interval(0.5).is_ok());
        assert!(check_interval(2.0).is_ok());
    }

    #[test]
    fn text_limit_floor_is_ten() {
        assert!(matches!(check_text_limit(9), Err(ConfigError::TextLimit(9))));
        assert!(check_text_limit(10).is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = Settings::from_json(r#"{ "interval_secs": 5.0, "text_limit": 80 }"#).unwrap();
        assert_eq!(settings.interval(), Duration::from_secs(5));
        assert_eq!(settings.text_limit, 80);
        assert_eq!(settings.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn json_with_out_of_range_values_is_rejected() {
        let result = Settings::from_json(r#"{ "timeout_secs": 0 }"#);
        assert_eq!(result, Err(ConfigError::Zero("timeout")));

        let result = Settings::from_json("not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
