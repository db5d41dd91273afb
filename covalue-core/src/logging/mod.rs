//! Logging subsystem for covalue nodes
//!
//! All crate modules log through `tracing` with structured fields
//! (`co_value`, `peer`, `session`). This module installs the subscriber
//! that renders those events, either as human readable lines or JSON.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// The minimum log level to display
    pub level: LogLevel,
    /// Whether to include target module information
    pub with_target: bool,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Raise sync traffic (`covalue_core::sync`) to at least `debug`;
    /// otherwise it is clamped to `warn`
    pub verbose_sync: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: true,
            json_format: false,
            verbose_sync: false,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with specified level
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set whether to include target information
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Set whether to use JSON formatting
    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    /// Log every sync message instead of only sync warnings
    pub fn verbose_sync(mut self, enabled: bool) -> Self {
        self.verbose_sync = enabled;
        self
    }

    /// Directive string handed to `EnvFilter` when `RUST_LOG` is unset
    pub fn filter_directives(&self) -> String {
        let level = self.level.as_str();
        match (self.verbose_sync, self.level) {
            (true, LogLevel::Trace | LogLevel::Debug) => level.to_string(),
            (true, _) => format!("{},covalue_core::sync=debug", level),
            (false, LogLevel::Warn | LogLevel::Error) => level.to_string(),
            (false, _) => format!("{},covalue_core::sync=warn", level),
        }
    }
}

impl TryFrom<&LoggingConfig> for LogConfig {
    type Error = LoggingError;

    fn try_from(settings: &LoggingConfig) -> Result<Self, Self::Error> {
        let level = LogLevel::from_str(&settings.level).ok_or_else(|| {
            LoggingError::InvalidConfiguration(format!("unknown level '{}'", settings.level))
        })?;

        Ok(LogConfig::new(level)
            .with_target(settings.with_target)
            .json_format(settings.json_format)
            .verbose_sync(settings.verbose_sync))
    }
}

/// Initialize the logging subsystem with default configuration
///
/// # Example
/// ```
/// use covalue_core::logging::init_logging;
///
/// init_logging().expect("Failed to initialize logging");
/// ```
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Initialize the logging subsystem with custom configuration
///
/// `RUST_LOG` takes precedence over the configured level when present.
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = fmt::layer().with_target(config.with_target);

    if config.json_format {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert!(matches!(config.level, LogLevel::Info));
        assert!(config.with_target);
        assert!(!config.json_format);
        assert!(!config.verbose_sync);
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new(LogLevel::Debug)
            .with_target(false)
            .json_format(true)
            .verbose_sync(true);

        assert!(matches!(config.level, LogLevel::Debug));
        assert!(!config.with_target);
        assert!(config.json_format);
        assert!(config.verbose_sync);
    }

    #[test]
    fn test_filter_directives_clamp_sync() {
        let quiet = LogConfig::new(LogLevel::Debug);
        assert_eq!(quiet.filter_directives(), "debug,covalue_core::sync=warn");

        let verbose = LogConfig::new(LogLevel::Debug).verbose_sync(true);
        assert_eq!(verbose.filter_directives(), "debug");

        let errors_only = LogConfig::new(LogLevel::Error);
        assert_eq!(errors_only.filter_directives(), "error");
    }

    #[test]
    fn test_verbose_sync_raises_sync_to_debug() {
        let info = LogConfig::new(LogLevel::Info).verbose_sync(true);
        assert_eq!(info.filter_directives(), "info,covalue_core::sync=debug");

        let errors = LogConfig::new(LogLevel::Error).verbose_sync(true);
        assert_eq!(errors.filter_directives(), "error,covalue_core::sync=debug");

        let trace = LogConfig::new(LogLevel::Trace).verbose_sync(true);
        assert_eq!(trace.filter_directives(), "trace");
    }

    #[test]
    fn test_from_settings() {
        let mut settings = LoggingConfig::default();
        settings.level = "trace".to_string();
        settings.json_format = true;

        let config = LogConfig::try_from(&settings).unwrap();
        assert_eq!(config.level, LogLevel::Trace);
        assert!(config.json_format);

        settings.level = "loud".to_string();
        assert!(matches!(
            LogConfig::try_from(&settings),
            Err(LoggingError::InvalidConfiguration(_))
        ));
    }
}
