use batcher::{BatchConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "stat_forwarder".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            sentry_dsn: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub batcher: BatchConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.batcher.validate()?;

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid batcher config: {0}")]
    Invalid(#[from] ValidationError),
}
