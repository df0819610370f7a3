//! Pipeline configuration loaded from TOML.
//!
//! Resolution order for [`PipelineConfig::load_default`]:
//! 1. Path in the `HARVEST_CONFIG` environment variable
//! 2. Built-in defaults (no sources configured)

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "HARVEST_CONFIG";

/// Upper bound for a source's default lookback (about a century).
pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Per-source connection settings, keyed by source identifier.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Maximum number of tasks running at once.
    pub worker_concurrency: usize,

    /// Retries after the first attempt before a task is marked failed.
    pub max_retries: u32,

    /// Fixed delay before a failed task is re-run.
    pub retry_countdown_secs: u64,

    /// Enqueue normalization for records whose payload did not change.
    pub reprocess_unchanged: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            max_retries: 3,
            retry_countdown_secs: 10,
            reprocess_unchanged: false,
        }
    }
}

impl RuntimeConfig {
    pub fn retry_countdown(&self) -> Duration {
        Duration::from_secs(self.retry_countdown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Sparql(SparqlConfig),
    Rss(RssConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SparqlConfig {
    /// SPARQL query endpoint URL.
    pub endpoint: String,
    pub email: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_sparql_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RssConfig {
    /// Feed URL; the feed only ever lists its most recent items.
    pub url: String,
    #[serde(default = "default_rss_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_page_size() -> usize {
    1000
}

fn default_sparql_lookback_days() -> i64 {
    2
}

fn default_rss_lookback_days() -> i64 {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::load(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "runtime.worker_concurrency must be at least 1".to_string(),
            ));
        }

        for (name, source) in &self.sources {
            match source {
                SourceConfig::Sparql(sparql) => {
                    require_non_empty(name, "endpoint", &sparql.endpoint)?;
                    if sparql.page_size == 0 {
                        return Err(ConfigError::Invalid(format!(
                            "sources.{name}.page_size must be at least 1"
                        )));
                    }
                    check_lookback(name, sparql.lookback_days)?;
                }
                SourceConfig::Rss(rss) => {
                    require_non_empty(name, "url", &rss.url)?;
                    check_lookback(name, rss.lookback_days)?;
                }
            }
        }

        Ok(())
    }
}

fn require_non_empty(name: &str, field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "sources.{name}.{field} must not be empty"
        )));
    }
    Ok(())
}

fn check_lookback(name: &str, days: i64) -> Result<(), ConfigError> {
    if !(1..=MAX_LOOKBACK_DAYS).contains(&days) {
        return Err(ConfigError::Invalid(format!(
            "sources.{name}.lookback_days must be between 1 and {MAX_LOOKBACK_DAYS}"
        )));
    }
    Ok(())
}
