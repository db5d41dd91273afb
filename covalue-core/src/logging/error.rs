//! Error types for the logging subsystem

use std::fmt;

/// Errors that can occur while installing the subscriber
#[derive(Debug, Clone)]
pub enum LoggingError {
    /// A global subscriber was already set, or the layer stack failed
    InitializationFailed(String),
    /// The settings could not be turned into a filter
    InvalidConfiguration(String),
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggingError::InitializationFailed(msg) => {
                write!(f, "Failed to initialize logging: {}", msg)
            }
            LoggingError::InvalidConfiguration(msg) => {
                write!(f, "Invalid logging configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for LoggingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_error_display() {
        let err = LoggingError::InitializationFailed("already set".to_string());
        assert_eq!(format!("{}", err), "Failed to initialize logging: already set");

        let err = LoggingError::InvalidConfiguration("unknown level 'loud'".to_string());
        assert_eq!(
            format!("{}", err),
            "Invalid logging configuration: unknown level 'loud'"
        );
    }
}
