//! Configuration error types.

use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("failed to read config {path}: {source}")]
    ReadError {
        /// The file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A config file did not parse as TOML.
    #[error("failed to parse config {path}: {source}")]
    ParseError {
        /// The file path.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A field failed validation.
    #[error("invalid config: {field}: {message}")]
    ValidationError {
        /// Dotted field path (`logging.level`).
        field: String,
        /// What was wrong.
        message: String,
    },
}

impl ConfigError {
    /// Helper for building validation failures.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
