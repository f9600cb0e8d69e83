//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::data::Dataset;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub reconnect: ReconnectConfig,
    pub cache: CacheConfig,
    pub access: AccessConfig,
    pub fallback: FallbackConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

/// Operations surface bind address
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Live document database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string (`mongodb://`, `mongodb+srv://` or `memory://`)
    ///
    /// Absence is reported by the connection manager, not at load time,
    /// so the process can still serve from fallback snapshots.
    pub uri: Option<String>,
    /// Database name
    pub name: String,
    /// Application name reported to the server
    pub app_name: String,
    pub connect_timeout_ms: u64,
    pub server_selection_timeout_ms: u64,
    /// Upper bound for every individual live call
    pub query_timeout_ms: u64,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Reconnection backoff
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    /// Delay to wait after `previous` failed.
    pub fn next_delay(&self, previous: Duration) -> Duration {
        let max = Duration::from_secs(self.max_delay_secs);
        previous.mul_f64(self.multiplier).min(max)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries (default: 100)
    pub max_capacity: usize,
    pub ttl_by_id_secs: u64,
    pub ttl_by_key_secs: u64,
    pub ttl_scan_secs: u64,
    /// Optional on-disk backup of the cache
    pub persist_path: Option<PathBuf>,
    pub persist_interval_secs: u64,
}

/// Facade query bounds
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Cap on records returned by an owner scan
    pub max_scan_results: usize,
    /// Fields fetched from the live store per dataset; empty means all fields
    #[serde(default)]
    pub projections: HashMap<Dataset, Vec<String>>,
}

/// Fallback snapshot configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    /// Directory holding one `<dataset>.json` per snapshotted dataset
    pub data_dir: PathBuf,
    /// Datasets that keep an on-disk snapshot
    pub datasets: Vec<Dataset>,
    /// TTL of the in-memory copy of a snapshot
    pub cache_ttl_secs: u64,
    /// Full-dataset sync interval (0 disables the periodic sync)
    pub sync_interval_secs: u64,
    pub max_sync_records: usize,
    pub bootstrap_admin: BootstrapAdminConfig,
}

/// Record written to the users snapshot when none exists
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapAdminConfig {
    pub username: String,
    pub email: String,
    pub display_name: String,
}

/// Health monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Sampling interval (default: 900 = 15 minutes)
    pub interval_secs: u64,
    /// Metrics snapshot file
    pub snapshot_path: PathBuf,
    /// Directory pruned of stale temporary files
    pub temp_dir: Option<PathBuf>,
    pub temp_retention_secs: u64,
    /// Fraction of failed requests (0.0 - 1.0) above which the service is unhealthy
    pub error_rate_threshold: f64,
    /// Smoothing factor for the recent error rate
    pub error_rate_alpha: f64,
    /// Requests required before the error rate is trusted
    pub min_requests: u64,
    /// Percentages (0 - 100)
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (SHELTER__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.name", "shelter")?
            .set_default("database.app_name", "shelter")?
            .set_default("database.connect_timeout_ms", 5000)?
            .set_default("database.server_selection_timeout_ms", 5000)?
            .set_default("database.query_timeout_ms", 3000)?
            .set_default("database.max_pool_size", 10)?
            .set_default("database.min_pool_size", 1)?
            .set_default("reconnect.initial_delay_secs", 5)?
            .set_default("reconnect.max_delay_secs", 300)?
            .set_default("reconnect.multiplier", 2.0)?
            .set_default("cache.max_capacity", 100)?
            .set_default("cache.ttl_by_id_secs", 300)?
            .set_default("cache.ttl_by_key_secs", 300)?
            .set_default("cache.ttl_scan_secs", 60)?
            .set_default("cache.persist_interval_secs", 600)?
            .set_default("access.max_scan_results", 100)?
            .set_default("fallback.data_dir", "data/fallback")?
            .set_default("fallback.datasets", vec!["users", "products", "categories"])?
            .set_default("fallback.cache_ttl_secs", 30)?
            .set_default("fallback.sync_interval_secs", 3600)?
            .set_default("fallback.max_sync_records", 10_000)?
            .set_default("fallback.bootstrap_admin.username", "admin")?
            .set_default("fallback.bootstrap_admin.email", "admin@localhost")?
            .set_default("fallback.bootstrap_admin.display_name", "Administrator")?
            .set_default("health.interval_secs", 900)?
            .set_default("health.snapshot_path", "data/health_metrics.json")?
            .set_default("health.temp_retention_secs", 86400)?
            .set_default("health.error_rate_threshold", 0.25)?
            .set_default("health.error_rate_alpha", 0.1)?
            .set_default("health.min_requests", 20)?
            .set_default("health.cpu_threshold", 90.0)?
            .set_default("health.memory_threshold", 90.0)?
            .set_default("health.disk_threshold", 95.0)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("SHELTER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("fallback.datasets")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.cache.max_capacity == 0 {
            return Err(AppError::Config(
                "cache.max_capacity must be greater than 0".to_string(),
            ));
        }

        if self.access.max_scan_results == 0 {
            return Err(AppError::Config(
                "access.max_scan_results must be greater than 0".to_string(),
            ));
        }

        if self.database.query_timeout_ms == 0 {
            return Err(AppError::Config(
                "database.query_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.initial_delay_secs == 0 {
            return Err(AppError::Config(
                "reconnect.initial_delay_secs must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.initial_delay_secs > self.reconnect.max_delay_secs {
            return Err(AppError::Config(
                "reconnect.initial_delay_secs must not exceed reconnect.max_delay_secs".to_string(),
            ));
        }

        if self.reconnect.multiplier < 1.0 || !self.reconnect.multiplier.is_finite() {
            return Err(AppError::Config(
                "reconnect.multiplier must be a finite value >= 1.0".to_string(),
            ));
        }

        if self.fallback.data_dir.as_os_str().is_empty() {
            return Err(AppError::Config(
                "fallback.data_dir must not be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.health.error_rate_threshold) {
            return Err(AppError::Config(
                "health.error_rate_threshold must be within 0.0..=1.0".to_string(),
            ));
        }

        if !(self.health.error_rate_alpha > 0.0 && self.health.error_rate_alpha <= 1.0) {
            return Err(AppError::Config(
                "health.error_rate_alpha must be within (0.0, 1.0]".to_string(),
            ));
        }

        for (name, value) in [
            ("health.cpu_threshold", self.health.cpu_threshold),
            ("health.memory_threshold", self.health.memory_threshold),
            ("health.disk_threshold", self.health.disk_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(AppError::Config(format!(
                    "{name} must be a percentage within 0..=100"
                )));
            }
        }

        if self.database.uri.is_none() {
            tracing::warn!("database.uri is not set; serving from fallback snapshots only");
        }

        Ok(())
    }
}
