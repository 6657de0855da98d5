//! Error types for the pool service

use crate::telemetry::TelemetryError;
use thiserror::Error;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, Error>;

/// Service errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unreadable configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Core error (state store, audit chain)
    #[error(transparent)]
    Core(#[from] pool_core::Error),

    /// Telemetry acquisition or validation error
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// HTTP server error
    #[error("Server error: {0}")]
    Server(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}
