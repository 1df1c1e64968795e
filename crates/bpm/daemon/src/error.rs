//! Error types for bpm-daemon

use bpm_engine::StoreError;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Seed fixture could not be read or applied
    #[error("Seed error: {0}")]
    Seed(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::Config(e.to_string())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
