//! Component records persisted in the registry

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plugin-defined scalars attached to a record
pub type Metadata = BTreeMap<String, Value>;

/// Exit code for a process interrupted by SIGINT
pub const SIGINT_EXITCODE: i32 = 130;

/// Exit code for a process killed by SIGKILL
pub const SIGKILL_EXITCODE: i32 = 137;

/// Lifecycle state of a component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Spawned but no state committed yet
    #[default]
    None,
    Running,
    Stopped,
    Failed,
}

impl ComponentState {
    /// Classify a child's exit code.
    ///
    /// `0`, `130` (SIGINT) and `137` (SIGKILL) are deliberate stops.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 | SIGINT_EXITCODE | SIGKILL_EXITCODE => ComponentState::Stopped,
            _ => ComponentState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ComponentState::Stopped | ComponentState::Failed)
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentState::None => "None",
            ComponentState::Running => "Running",
            ComponentState::Stopped => "Stopped",
            ComponentState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// How a component was launched. Stored in metadata under `launch_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Inline,
    Background,
    NewTerminal,
}

impl LaunchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Inline => "inline",
            LaunchMode::Background => "background",
            LaunchMode::NewTerminal => "new_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inline" => Some(LaunchMode::Inline),
            "background" => Some(LaunchMode::Background),
            "new_terminal" => Some(LaunchMode::NewTerminal),
            _ => None,
        }
    }
}

/// Well-known metadata keys
pub mod keys {
    pub const RPCPORT: &str = "rpcport";
    pub const RPCHOST: &str = "rpchost";
    pub const P2P_PORT: &str = "p2p_port";
    pub const DATADIR: &str = "datadir";
    pub const CONFIG_PATH: &str = "config_path";
    pub const LAUNCH_MODE: &str = "launch_mode";
}

/// One managed component instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: String,
    pub pid: Option<u32>,
    pub component_type: String,
    pub location: Option<PathBuf>,
    pub status_endpoint: Option<String>,
    pub component_state: ComponentState,
    #[serde(default)]
    pub metadata: Metadata,
    pub logging_path: Option<PathBuf>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl ComponentRecord {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pid: None,
            component_type: component_type.into(),
            location: None,
            status_endpoint: None,
            component_state: ComponentState::None,
            metadata: Metadata::new(),
            logging_path: None,
            last_updated: Utc::now(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_status_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.status_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_state(mut self, state: ComponentState) -> Self {
        self.component_state = state;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_logging_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.logging_path = Some(path.into());
        self
    }

    /// Integer metadata value, accepting numbers stored as strings
    pub fn metadata_u16(&self, key: &str) -> Option<u16> {
        match self.metadata.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn launch_mode(&self) -> Option<LaunchMode> {
        self.metadata_str(keys::LAUNCH_MODE).and_then(LaunchMode::parse)
    }

    /// True when the record claims a live process
    pub fn is_running(&self) -> bool {
        self.component_state == ComponentState::Running && self.pid.is_some()
    }
}
