//! Errors raised while loading binding configuration.

use std::io;

use thiserror::Error;

/// Failure to load or validate a [`BindingConfig`](crate::BindingConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("cannot read binding config {path}: {source}")]
    ReadError {
        /// Path to the config file that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML configuration.
    #[error("malformed binding config {path}: {source}")]
    ParseError {
        /// Path of the source, or `<inline>` for strings.
        path: String,
        /// Underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },

    /// An environment override could not be applied.
    #[error("bad override {var_name}: {message}")]
    EnvError {
        /// Name of the environment variable.
        var_name: String,
        /// Error description.
        message: String,
    },

    /// Configuration validation failed.
    #[error("invalid {field}: {message}")]
    ValidationError {
        /// Field that failed validation.
        field: String,
        /// Validation failure description.
        message: String,
    },
}

/// Result of loading configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;
