//! Error types for the oxidized-cell atomic primitives

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Atomic error: {0}")]
    Atomic(#[from] AtomicError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the multi-location atomic commit primitive
///
/// Commit contention is not an error: `commit()` reports it as `false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtomicError {
    #[error("Transaction capacity exceeded: at most {capacity} cells per transaction")]
    CapacityExceeded { capacity: usize },

    #[error("Atomic runtime already initialized with different settings")]
    AlreadyInitialized,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
