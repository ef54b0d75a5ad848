//! Core error types

use thiserror::Error;

/// Core error type for keyburn
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed device UID
    #[error("Invalid UID: {0}")]
    InvalidUid(String),

    /// Name does not match the key file pattern
    #[error("Invalid key file name: {0:?}")]
    InvalidKeyName(String),

    /// Configuration could not be parsed or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<toml::de::Error> for CoreError {
    fn from(error: toml::de::Error) -> Self {
        CoreError::Config(error.to_string())
    }
}
