//! Server configuration loading from file and environment variables.

use databus_core::{BusSettings, JobSettings, LongPollSettings};
use databus_db::DbRuntimeSettings;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Delivery, job and maintenance tunables.
    #[serde(default)]
    pub bus: BusConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "databus_core=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Bus tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Longest a poll request may wait for events, in milliseconds.
    #[serde(default = "default_long_poll_max_wait_ms")]
    pub long_poll_max_wait_ms: u64,

    /// How often a waiting poll re-checks storage, in milliseconds.
    #[serde(default = "default_long_poll_recheck_ms")]
    pub long_poll_recheck_ms: u64,

    /// Events moved per move-job transaction.
    #[serde(default = "default_batch_size")]
    pub move_batch_size: usize,

    /// Mutations scanned per replay-job transaction.
    #[serde(default = "default_batch_size")]
    pub replay_batch_size: usize,

    /// How long finished jobs remain queryable, in seconds.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// Interval between maintenance sweeps, in seconds. 0 disables sweeping.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "databus.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_long_poll_max_wait_ms() -> u64 {
    20_000
}

fn default_long_poll_recheck_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    500
}

fn default_job_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            long_poll_max_wait_ms: default_long_poll_max_wait_ms(),
            long_poll_recheck_ms: default_long_poll_recheck_ms(),
            move_batch_size: default_batch_size(),
            replay_batch_size: default_batch_size(),
            job_retention_secs: default_job_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl BusConfig {
    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            long_poll: LongPollSettings {
                max_wait: Duration::from_millis(self.long_poll_max_wait_ms),
                recheck_interval: Duration::from_millis(self.long_poll_recheck_ms.max(1)),
            },
            jobs: JobSettings {
                move_batch_size: self.move_batch_size.max(1),
                replay_batch_size: self.replay_batch_size.max(1),
                ..JobSettings::default()
            },
            job_retention: Duration::from_secs(self.job_retention_secs),
            ..BusSettings::default()
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `DATABUS_HOST` overrides `server.host`
/// - `DATABUS_PORT` overrides `server.port`
/// - `DATABUS_DB_PATH` overrides `database.path`
/// - `DATABUS_LOG_LEVEL` overrides `logging.level`
/// - `DATABUS_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `DATABUS_LONG_POLL_MAX_WAIT_MS` overrides `bus.long_poll_max_wait_ms`
/// - `DATABUS_SWEEP_INTERVAL_SECS` overrides `bus.sweep_interval_secs`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Applies `DATABUS_*` overrides read through `lookup`. Unparseable values
/// are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = lookup("DATABUS_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = lookup("DATABUS_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(db_path) = lookup("DATABUS_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("DATABUS_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("DATABUS_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(parsed) = lookup("DATABUS_LONG_POLL_MAX_WAIT_MS").and_then(|v| v.parse().ok()) {
        config.bus.long_poll_max_wait_ms = parsed;
    }
    if let Some(parsed) = lookup("DATABUS_SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.bus.sweep_interval_secs = parsed;
    }
}
