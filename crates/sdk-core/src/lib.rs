//! SDK Core
//!
//! Shared foundation for the ElectrumSV SDK binaries:
//! - Well-known directory layout and `config.json`
//! - Component records and the file-locked JSON registry
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod record;
pub mod registry;

pub use config::SdkConfig;
pub use error::{ConfigError, ConfigResult, RegistryError, RegistryResult};
pub use paths::SdkPaths;
pub use record::{ComponentRecord, ComponentState, LaunchMode, Metadata};
pub use registry::{Registry, Snapshot};
