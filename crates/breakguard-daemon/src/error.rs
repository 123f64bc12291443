//! Error types for the BreakGuard daemon

use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors that can occur in the daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Core library error
    #[error(transparent)]
    Core(#[from] breakguard_core::CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] breakguard_core::ConfigError),

    /// Secret store or state file error
    #[error("Storage error: {0}")]
    Storage(#[from] breakguard_core::PersistenceError),

    /// The enforcement task is no longer running
    #[error("Enforcer is not running")]
    EnforcerStopped,

    /// No usable data directory
    #[error("No data directory available - set data_dir in the config")]
    NoDataDir,
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Serialization(e.to_string())
    }
}

impl From<breakguard_core::AuthError> for DaemonError {
    fn from(e: breakguard_core::AuthError) -> Self {
        DaemonError::Core(e.into())
    }
}
