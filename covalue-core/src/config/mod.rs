//! Configuration management for covalue nodes
//!
//! Defaults, TOML files and `COVALUE_<SECTION>_<KEY>` environment
//! variables all produce the same [`Config`], which is validated before use.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sync and load behaviour
    pub sync: SyncConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Persistence configuration
    pub storage: StorageConfig,
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base of the load retry backoff; attempt `n` waits `base * 3^n`
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Retry rounds against `retry_unavailable` peers before giving up
    pub max_load_retries: u32,

    /// How long a single load round waits for every peer to answer
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,

    /// Deadline for `LocalNode::wait_for_sync`
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,

    /// Log sync traffic at debug rather than only sync warnings
    pub verbose_sync: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file; in-memory storage is used when unset
    pub sqlite_path: Option<PathBuf>,

    /// Connection pool size for the SQLite backend
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    4
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            pool_size: default_pool_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_secs(1),
            max_load_retries: 5,
            load_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Delay before retry `attempt` (zero-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(3u32.saturating_pow(attempt))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
            verbose_sync: false,
        }
    }
}

fn parse_duration(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", var, e)))
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", var, e)))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: COVALUE_<SECTION>_<KEY>
    /// Example: COVALUE_SYNC_RETRY_BASE_DELAY=500ms
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Sync config
        if let Ok(delay) = env::var("COVALUE_SYNC_RETRY_BASE_DELAY") {
            config.sync.retry_base_delay = parse_duration("retry base delay", &delay)?;
        }
        if let Ok(retries) = env::var("COVALUE_SYNC_MAX_LOAD_RETRIES") {
            config.sync.max_load_retries = retries.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid max load retries: {}", e))
            })?;
        }
        if let Ok(timeout) = env::var("COVALUE_SYNC_LOAD_TIMEOUT") {
            config.sync.load_timeout = parse_duration("load timeout", &timeout)?;
        }
        if let Ok(timeout) = env::var("COVALUE_SYNC_SYNC_TIMEOUT") {
            config.sync.sync_timeout = parse_duration("sync timeout", &timeout)?;
        }

        // Logging config
        if let Ok(level) = env::var("COVALUE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(json) = env::var("COVALUE_LOG_JSON") {
            config.logging.json_format = parse_flag("JSON flag", &json)?;
        }
        if let Ok(verbose) = env::var("COVALUE_LOG_VERBOSE_SYNC") {
            config.logging.verbose_sync = parse_flag("verbose sync flag", &verbose)?;
        }

        // Storage config
        if let Ok(path) = env::var("COVALUE_STORAGE_SQLITE_PATH") {
            config.storage.sqlite_path = Some(PathBuf::from(path));
        }
        if let Ok(size) = env::var("COVALUE_STORAGE_POOL_SIZE") {
            config.storage.pool_size = size
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid pool size: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.retry_base_delay.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "retry_base_delay must be greater than 0".to_string(),
            ));
        }

        if self.sync.load_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "load_timeout must be greater than 0".to_string(),
            ));
        }

        if self.storage.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.sync.max_load_retries, 5);
        assert!(config.storage.sqlite_path.is_none());
        assert_eq!(config.storage.pool_size, 4);
    }

    #[test]
    fn test_retry_delay_is_exponential() {
        let sync = SyncConfig::default();
        assert_eq!(sync.retry_delay(0), Duration::from_secs(1));
        assert_eq!(sync.retry_delay(1), Duration::from_secs(3));
        assert_eq!(sync.retry_delay(2), Duration::from_secs(9));
        assert_eq!(sync.retry_delay(3), Duration::from_secs(27));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.sync.retry_base_delay = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.storage.pool_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covalue.toml");

        let mut config = Config::default();
        config.sync.retry_base_delay = Duration::from_millis(250);
        config.storage.sqlite_path = Some(PathBuf::from("/tmp/covalue.db"));
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.sync.retry_base_delay, Duration::from_millis(250));
        assert_eq!(loaded.storage.sqlite_path, config.storage.sqlite_path);
    }

    #[test]
    fn test_parse_from_toml() {
        let toml = r#"
            [sync]
            retry_base_delay = "10ms"
            max_load_retries = 2
            load_timeout = "1s"
            sync_timeout = "5s"

            [logging]
            level = "debug"
            json_format = true
            with_target = false
            verbose_sync = true

            [storage]
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.retry_delay(1), Duration::from_millis(30));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.pool_size, 4);
    }
}
