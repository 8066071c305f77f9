//! Error types for the Bulwark layer.

use thiserror::Error;

/// Main error type for Bulwark operations.
///
/// Only configuration problems surface through this type at runtime; backend
/// and serialization failures are absorbed by the fallback path.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// Invalid policy or setting, rejected before any component starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be loaded
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Redis client errors (connection setup only)
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
