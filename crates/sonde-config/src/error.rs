use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while locating, parsing or validating
/// configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// TOML parsing failed.
    #[error("TOML parse error: {0}")]
    Parse(String),

    /// A config value failed validation.
    #[error("validation error: {field}: {message}")]
    Validation {
        /// The dotted field path (e.g. `session.thread_refresh_delay_ms`).
        field: String,
        /// Human-readable description of the violation.
        message: String,
    },

    /// A standard directory could not be determined.
    #[error("path error: {0}")]
    Path(String),

    /// An I/O error occurred while reading config files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
