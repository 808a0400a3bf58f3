//! Component plugins
//!
//! A plugin knows how to install, start, stop and reset one component type. Plugins
//! come from three tiers, searched in precedence order:
//!
//! - `local`: `./electrumsv_sdk_plugins/<name>/plugin.toml`
//! - `user`: `<SDK_HOME>/user_plugins/<name>/plugin.toml`
//! - `builtin`: compiled in (native or embedded manifest), optionally overridden by
//!   `built_in_components/<name>/plugin.toml` next to the binary

pub mod builtin;
pub mod context;
pub mod manifest;
pub mod resolver;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use clap::Command;

use crate::error::SdkResult;

pub use context::{Allocation, Network, PluginContext};
pub use manifest::{Manifest, ManifestPlugin};
pub use resolver::PluginRegistry;

/// Manifest file name inside a plugin directory
pub const MANIFEST_FILENAME: &str = "plugin.toml";

/// Where a plugin was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceTier {
    Builtin,
    User,
    Local,
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceTier::Builtin => "builtin",
            SourceTier::User => "user",
            SourceTier::Local => "local",
        })
    }
}

/// Resolved origin of a component type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Compiled in; `Some` when an on-disk `built_in_components` directory overrides it
    Builtin(Option<PathBuf>),
    User(PathBuf),
    Local(PathBuf),
}

impl PluginSource {
    pub fn tier(&self) -> SourceTier {
        match self {
            PluginSource::Builtin(_) => SourceTier::Builtin,
            PluginSource::User(_) => SourceTier::User,
            PluginSource::Local(_) => SourceTier::Local,
        }
    }

    /// Plugin directory on disk, if any
    pub fn dir(&self) -> Option<&PathBuf> {
        match self {
            PluginSource::Builtin(dir) => dir.as_ref(),
            PluginSource::User(dir) | PluginSource::Local(dir) => Some(dir),
        }
    }
}

/// Static facts about a plugin
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub name: String,
    pub source_tier: SourceTier,
    pub default_port: Option<u16>,
    /// Ports only the default id may bind
    pub reserved_ports: BTreeSet<u16>,
    pub default_remote_repo: Option<String>,
    /// How long `stop` waits after the interrupt before killing
    pub graceful_wait: Duration,
    pub location: Option<PathBuf>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, source_tier: SourceTier) -> Self {
        Self {
            name: name.into(),
            source_tier,
            default_port: None,
            reserved_ports: BTreeSet::new(),
            default_remote_repo: None,
            graceful_wait: Duration::ZERO,
            location: None,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    pub fn with_reserved_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.reserved_ports = ports.into_iter().collect();
        self
    }

    pub fn with_remote_repo(mut self, repo: impl Into<String>) -> Self {
        self.default_remote_repo = Some(repo.into());
        self
    }

    pub fn with_graceful_wait(mut self, wait: Duration) -> Self {
        self.graceful_wait = wait;
        self
    }

    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Lifecycle contract every component type implements
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Add options to the `start` grammar; returns the new argument ids
    fn extend_start_cli(&self, cmd: Command) -> (Command, Vec<String>) {
        (cmd, Vec::new())
    }

    /// Add options to the `reset` grammar; returns the new argument ids
    fn extend_reset_cli(&self, cmd: Command) -> (Command, Vec<String>) {
        (cmd, Vec::new())
    }

    async fn install(&self, ctx: &PluginContext<'_>) -> SdkResult<()>;

    async fn start(&self, ctx: &PluginContext<'_>) -> SdkResult<()>;

    /// Interrupt, then kill, every selected instance
    async fn stop(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        for record in ctx.target_records()? {
            ctx.stop_record(&record).await?;
        }
        Ok(())
    }

    /// Stop the selected instances and empty their datadirs; records are kept
    async fn reset(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        for id in ctx.target_ids()? {
            if let Some(record) = ctx.app().registry().get_by_id(&id)? {
                ctx.stop_record(&record).await?;
            }
            ctx.wipe_datadir(&id)?;
        }
        Ok(())
    }
}
