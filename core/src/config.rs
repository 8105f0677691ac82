use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::errors::ConfigError;

pub const CONFIG_ENV_VAR: &str = "IMPORT_CONFIG";
/// Upper bound for `miniserver.max_retries`.
pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ImportConfig {
    pub miniserver: MiniserverConfig,
    pub influxdb: InfluxConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    pub stats_map: HashMap<String, StatsMapEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MiniserverConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_controller_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Offset of the controller's local clock; stats timestamps carry no zone.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InfluxConfig {
    pub host: String,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_influx_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StatsMapEntry {
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_controller_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_influx_port() -> u16 {
    8086
}

fn default_influx_timeout_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    5000
}

fn default_concurrency() -> usize {
    4
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

impl MiniserverConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Falls back to UTC for offsets `validate` would reject.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
    }
}

impl InfluxConfig {
    pub fn write_url(&self) -> String {
        format!("{}://{}:{}/write", self.scheme, self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Loads from `config_path`, or from `IMPORT_CONFIG` when no path is given,
/// and validates the result.
pub fn load_config(config_path: Option<&str>) -> Result<ImportConfig, ConfigError> {
    let config = match config_path {
        Some(path) => ImportConfig::from_file(path)?,
        None => ImportConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl ImportConfig {
    /// Accepts YAML and, since YAML is a superset of it, JSON.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_string(),
            error: Box::new(e),
        })?;
        let config: ImportConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: format!("{} environment variable not set", CONFIG_ENV_VAR),
        })?;
        let config: ImportConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.miniserver.host.is_empty() {
            return Err(invalid("Miniserver host cannot be empty"));
        }
        if self.miniserver.utc_offset_minutes.unsigned_abs() > 14 * 60 {
            return Err(invalid("Miniserver UTC offset must be within 14 hours"));
        }
        if self.miniserver.request_timeout_ms == 0 {
            return Err(invalid("Miniserver request timeout must be positive"));
        }
        if self.miniserver.max_retries > MAX_RETRIES {
            return Err(invalid(&format!(
                "Miniserver max_retries cannot exceed {}",
                MAX_RETRIES
            )));
        }
        if self.miniserver.max_retries > 0 && self.miniserver.retry_delay_ms == 0 {
            return Err(invalid("Miniserver retry delay must be positive"));
        }
        if self.influxdb.host.is_empty() {
            return Err(invalid("InfluxDB host cannot be empty"));
        }
        if self.influxdb.database.is_empty() {
            return Err(invalid("InfluxDB database cannot be empty"));
        }
        if self.influxdb.request_timeout_ms == 0 {
            return Err(invalid("InfluxDB request timeout must be positive"));
        }
        if self.processing.batch_size == 0 {
            return Err(invalid("Batch size must be at least 1"));
        }
        if self.processing.concurrency == 0 {
            return Err(invalid("Concurrency must be at least 1"));
        }

        for (id, entry) in &self.stats_map {
            if id.is_empty() {
                return Err(invalid("Stats map keys cannot be empty"));
            }
            if entry.measurement.is_empty() {
                return Err(invalid(&format!(
                    "Measurement for stats {} cannot be empty",
                    id
                )));
            }
            if entry.tags.iter().any(|(k, v)| k.is_empty() || v.is_empty()) {
                return Err(invalid(&format!(
                    "Tags for stats {} cannot have empty keys or values",
                    id
                )));
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.to_string(),
    }
}
