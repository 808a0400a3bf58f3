//! Error types shared by every SDK crate.

use std::path::PathBuf;
use std::time::Duration;

/// Errors raised by the component registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Timed out after {timeout:?} waiting for registry lock: {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Cannot filter the registry by component type and id at the same time")]
    AmbiguousFilter,

    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while resolving directories or loading `config.json`
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine the user's home directory")]
    NoHomeDir,

    #[error("Invalid SDK configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    #[error("Failed to read or write configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Invalid(Box::new(err))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
