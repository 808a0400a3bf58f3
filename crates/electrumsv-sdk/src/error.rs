//! Error taxonomy
//!
//! Each subsystem has its own enum; [`SdkError`] aggregates them for the CLI and
//! decides the process exit code.

use std::path::PathBuf;

use sdk_core::{ConfigError, RegistryError};

/// Bad CLI tokens, unknown components, conflicting flags
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error(
        "First argument must be one of: [install, start, stop, reset, node, status, config, --help, --version] (got '{0}')"
    )]
    UnknownVerb(String),

    #[error("Unknown component '{name}'. Must select from: {known}")]
    UnknownComponent { name: String, known: String },

    #[error("Unexpected argument '{0}'")]
    UnexpectedArgument(String),

    #[error("{0}")]
    InvalidArgs(String),

    #[error("Only one network flag may be set, got: {0}")]
    ConflictingNetworks(String),

    #[error("RPC method not indicated. Requires at least one argument")]
    MissingRpcMethod,

    #[error("No component record found for id '{0}'")]
    UnknownId(String),

    #[error("--id '{id}' belongs to a '{actual}' component, not '{requested}'")]
    IdTypeMismatch {
        id: String,
        actual: String,
        requested: String,
    },

    /// Help or version text requested by the user; not a failure
    #[error("{0}")]
    Display(String),
}

/// Plugin discovery or instantiation failures
#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    #[error("No plugin named '{0}' is registered")]
    UnknownPlugin(String),

    #[error("Plugin '{name}' has no plugin manifest at {path}")]
    MissingPlugin { name: String, path: PathBuf },

    #[error("Invalid plugin manifest {path}: {source}")]
    InvalidManifest {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("Reserved port {port} is claimed by both '{first}' and '{second}'")]
    ReservedPortConflict {
        port: u16,
        first: String,
        second: String,
    },

    #[error("Failed to read plugin: {0}")]
    Io(#[from] std::io::Error),
}

/// Id, datadir or port allocation failures
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Port {port} for '{id}' is already in use")]
    PortInUse { port: u16, id: String },

    #[error("No free port found above {0}")]
    NoFreePort(u16),

    #[error("A datadir already exists for id '{id}' at {path}; choose another --id")]
    DatadirExists { id: String, path: PathBuf },

    #[error("Component '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Datadir I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Launch and supervision failures
#[derive(Debug, thiserror::Error)]
pub enum SupervisionError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Component '{id}' exited with code {code}")]
    ExitedNonZero { id: String, code: i32 },

    #[error("Component '{0}' did not report a state in time")]
    CommitTimeout(String),

    #[error("Supervisor of '{0}' reported the launch as failed; see its log file")]
    LaunchFailed(String),

    #[error("Encrypted environment file error: {0}")]
    EnvFile(String),

    #[error("Invalid launch payload: {0}")]
    Payload(String),

    #[error("No terminal emulator available: {0}")]
    NoTerminal(String),

    #[error("Supervision I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Liveness probes and node RPC
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Node component '{0}' not found")]
    NodeNotFound(String),

    #[error("Component '{0}' is not responding")]
    NotResponding(String),
}

/// Top-level error for the SDK
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    PluginLoad(#[from] PluginLoadError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervision(#[from] SupervisionError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted")]
    Interrupted,
}

impl SdkError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SdkError::Usage(UsageError::Display(_)) => 0,
            SdkError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Errors scoped to one component; fan-out verbs log these and carry on
    pub fn is_component_scoped(&self) -> bool {
        matches!(
            self,
            SdkError::Resource(_) | SdkError::Supervision(_) | SdkError::Network(_)
        )
    }
}

/// Result type for SDK operations
pub type SdkResult<T> = Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SdkError::from(UsageError::Display("help".into())).exit_code(), 0);
        assert_eq!(SdkError::from(UsageError::MissingRpcMethod).exit_code(), 1);
        assert_eq!(SdkError::from(ResourceError::NoFreePort(1)).exit_code(), 1);
        assert_eq!(SdkError::Interrupted.exit_code(), 130);
    }

    #[test]
    fn test_component_scoped() {
        assert!(SdkError::from(ResourceError::AlreadyRunning("node1".into())).is_component_scoped());
        assert!(!SdkError::from(UsageError::MissingRpcMethod).is_component_scoped());
        assert!(
            !SdkError::from(RegistryError::AmbiguousFilter).is_component_scoped()
        );
    }
}
