//! Tools handed to a plugin for one verb invocation

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use sdk_core::{ComponentRecord, LaunchMode};

use super::PluginDescriptor;
use crate::allocator::{ResourceAllocator, claimed_ports, default_component_id};
use crate::app_state::AppState;
use crate::cli::CliInputs;
use crate::error::{ResourceError, SdkResult, UsageError};
use crate::supervisor::{self, LaunchSpec, LivenessConfig, kill};

/// Global network selector shared by node-facing components
pub const BITCOIN_NETWORK_ENV: &str = "BITCOIN_NETWORK";

/// Resources allocated for one start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: String,
    pub datadir: PathBuf,
    /// `None` for plugins without a default port
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Network {
    #[default]
    Regtest,
    Testnet,
}

impl Network {
    pub const FLAGS: [Network; 2] = [Network::Regtest, Network::Testnet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Regtest => "regtest",
            Network::Testnet => "testnet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::FLAGS
            .into_iter()
            .find(|n| n.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Per-invocation view of the engine for one plugin
pub struct PluginContext<'a> {
    app: &'a AppState,
    inputs: &'a CliInputs,
    descriptor: &'a PluginDescriptor,
}

impl<'a> PluginContext<'a> {
    pub fn new(app: &'a AppState, inputs: &'a CliInputs, descriptor: &'a PluginDescriptor) -> Self {
        Self {
            app,
            inputs,
            descriptor,
        }
    }

    pub fn app(&self) -> &'a AppState {
        self.app
    }

    pub fn inputs(&self) -> &'a CliInputs {
        self.inputs
    }

    pub fn descriptor(&self) -> &'a PluginDescriptor {
        self.descriptor
    }

    pub fn component_type(&self) -> &'a str {
        &self.descriptor.name
    }

    /// Allocate id, datadir and default port for a start.
    ///
    /// Refuses an id whose record still owns a live process.
    pub fn allocate(&self) -> SdkResult<Allocation> {
        let component_type = self.component_type();
        let snapshot = self.app.registry().get_all()?;
        let reserved = self.app.reserved_ports();

        let probe = self.app.probe();
        let base = ResourceAllocator::new(self.app.paths(), probe, &reserved);
        let id = base.allocate_id(
            component_type,
            self.inputs.component_id.as_deref(),
            self.inputs.new_flag,
        );
        if let Some(existing) = snapshot.get(&id) {
            if existing.is_running() && existing.pid.is_some_and(kill::pid_exists) {
                return Err(ResourceError::AlreadyRunning(id).into());
            }
        }

        let allocator = base.with_claimed_ports(claimed_ports(&snapshot, Some(&id)));
        let (id, datadir) = allocator.allocate_datadir(
            component_type,
            self.inputs.component_id.as_deref(),
            self.inputs.new_flag,
        )?;
        let port = match self.descriptor.default_port {
            Some(default) => Some(allocator.allocate_port(component_type, &id, default)?),
            None => None,
        };
        Ok(Allocation { id, datadir, port })
    }

    /// Secondary port (p2p, zmq, ...) for `id`, same rule as the default port
    pub fn allocate_port(&self, id: &str, default_port: u16) -> SdkResult<u16> {
        let snapshot = self.app.registry().get_all()?;
        let reserved = self.app.reserved_ports();
        let allocator = ResourceAllocator::new(self.app.paths(), self.app.probe(), &reserved)
            .with_claimed_ports(claimed_ports(&snapshot, Some(id)));
        Ok(allocator.allocate_port(self.component_type(), id, default_port)?)
    }

    pub fn log_file(&self, id: &str) -> SdkResult<PathBuf> {
        let reserved = self.app.reserved_ports();
        let allocator = ResourceAllocator::new(self.app.paths(), self.app.probe(), &reserved);
        Ok(allocator.log_file(self.component_type(), id)?)
    }

    /// Network from `--regtest`/`--testnet`, else `BITCOIN_NETWORK`, else regtest
    pub fn network(&self) -> Result<Network, UsageError> {
        let selected: Vec<Network> = Network::FLAGS
            .into_iter()
            .filter(|n| self.inputs.extension_flag(n.as_str()))
            .collect();
        match selected.as_slice() {
            [] => Ok(network_from_env()),
            [one] => Ok(*one),
            many => Err(UsageError::ConflictingNetworks(
                many.iter().map(Network::as_str).collect::<Vec<_>>().join(", "),
            )),
        }
    }

    /// Launch mode from the most specific flag: inline, background, new terminal
    pub fn launch_mode(&self, default: LaunchMode) -> LaunchMode {
        if self.inputs.inline_flag {
            LaunchMode::Inline
        } else if self.inputs.background_flag {
            LaunchMode::Background
        } else if self.inputs.new_terminal_flag {
            LaunchMode::NewTerminal
        } else {
            default
        }
    }

    /// `--repo`, else the plugin's default remote repo
    pub fn repo(&self) -> Option<String> {
        self.inputs
            .repo
            .clone()
            .filter(|r| !r.is_empty())
            .or_else(|| self.descriptor.default_remote_repo.clone())
    }

    pub fn branch(&self) -> Option<&'a str> {
        self.inputs.branch.as_deref().filter(|b| !b.is_empty())
    }

    /// Source checkout: a local `--repo` path, else `<SDK_HOME>/remote_repos/<type>`
    pub fn source_dir(&self) -> PathBuf {
        match self.inputs.repo.as_deref() {
            Some(repo) if !repo.is_empty() && !is_remote_repo(repo) => PathBuf::from(repo),
            _ => self.app.paths().remote_repo_dir(self.component_type()),
        }
    }

    /// Records selected by `--id` or, without it, every record of this type
    pub fn target_records(&self) -> SdkResult<Vec<ComponentRecord>> {
        let registry = self.app.registry();
        match self.inputs.component_id.as_deref() {
            Some(id) => {
                let record = registry
                    .get_by_id(id)?
                    .ok_or_else(|| UsageError::UnknownId(id.to_string()))?;
                self.check_type(&record)?;
                Ok(vec![record])
            }
            None => Ok(registry.get_by_type(self.component_type())?),
        }
    }

    /// Ids selected for reset. `--id` need not have a record; without `--id`, every
    /// record of this type, or the default id when its datadir exists.
    pub fn target_ids(&self) -> SdkResult<Vec<String>> {
        if let Some(id) = self.inputs.component_id.as_deref() {
            if let Some(record) = self.app.registry().get_by_id(id)? {
                self.check_type(&record)?;
            }
            return Ok(vec![id.to_string()]);
        }
        let mut ids: Vec<String> = self
            .app
            .registry()
            .get_by_type(self.component_type())?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if ids.is_empty() {
            let default_id = default_component_id(self.component_type());
            if self.datadir(&default_id).exists() {
                ids.push(default_id);
            }
        }
        Ok(ids)
    }

    fn check_type(&self, record: &ComponentRecord) -> Result<(), UsageError> {
        if record.component_type != self.component_type() {
            return Err(UsageError::IdTypeMismatch {
                id: record.id.clone(),
                actual: record.component_type.clone(),
                requested: self.component_type().to_string(),
            });
        }
        Ok(())
    }

    pub fn datadir(&self, id: &str) -> PathBuf {
        self.app.paths().component_datadir(self.component_type(), id)
    }

    /// Kill the record's process tree and settle its state
    pub async fn stop_record(&self, record: &ComponentRecord) -> SdkResult<()> {
        let outcome =
            supervisor::stop_component(self.app.registry(), record, self.descriptor.graceful_wait)
                .await?;
        if let Some(outcome) = outcome {
            info!(
                component_id = %record.id,
                interrupted = outcome.interrupted.len(),
                killed = outcome.killed.len(),
                "Stopped {}",
                record.id
            );
        }
        Ok(())
    }

    /// Empty the datadir of `id`, keeping the directory itself
    pub fn wipe_datadir(&self, id: &str) -> SdkResult<()> {
        let datadir = self.datadir(id);
        clear_dir(&datadir)?;
        info!(component_id = %id, "Reset datadir {}", datadir.display());
        Ok(())
    }

    pub async fn launch(&self, spec: LaunchSpec, mode: LaunchMode) -> SdkResult<ComponentRecord> {
        self.app
            .launcher()
            .launch(self.app.registry(), self.app.paths(), spec, mode)
            .await
    }

    /// Poll the record's status endpoint; a dead endpoint downgrades it to `Failed`
    pub async fn confirm_running(&self, record: &ComponentRecord) -> SdkResult<bool> {
        let Some(endpoint) = record.status_endpoint.as_deref() else {
            return Ok(true);
        };
        if !record.is_running() {
            return Ok(false);
        }
        let alive = supervisor::liveness::is_running_http(endpoint, &LivenessConfig::default()).await;
        if !alive {
            warn!(component_id = %record.id, "{} is not responding at {}", record.id, endpoint);
            self.app.registry().transition(
                &record.id,
                record.pid,
                sdk_core::ComponentState::Failed,
            )?;
        }
        Ok(alive)
    }
}

/// `BITCOIN_NETWORK`, defaulting to regtest
pub fn network_from_env() -> Network {
    match std::env::var(BITCOIN_NETWORK_ENV) {
        Ok(value) => Network::parse(&value).unwrap_or_else(|| {
            warn!("Unsupported {}={}, using regtest", BITCOIN_NETWORK_ENV, value);
            Network::Regtest
        }),
        Err(_) => Network::Regtest,
    }
}

/// Empty repo strings and https urls are remote; anything else is a local checkout
pub fn is_remote_repo(repo: &str) -> bool {
    repo.is_empty() || repo.starts_with("https://")
}

/// Remove everything inside `dir`, creating it if missing
pub fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    } else {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
