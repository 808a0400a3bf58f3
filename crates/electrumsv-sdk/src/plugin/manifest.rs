//! `plugin.toml` plugins
//!
//! A manifest describes a component declaratively: ports, repo, the launch command
//! and environment, install and reset steps, and extra CLI flags. Strings may use
//! `{placeholders}`, filled in when the verb runs:
//!
//! `{id}` `{port}` `{datadir}` `{location}` `{logs}` `{sdk_home}` `{network}` `{repo}`
//! `{branch}` `{python}`, plus one placeholder per declared flag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Arg, ArgAction, Command};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use sdk_core::record::keys;
use sdk_core::{ComponentRecord, LaunchMode};

use super::context::{Allocation, network_from_env};
use super::{MANIFEST_FILENAME, Plugin, PluginContext, PluginDescriptor, SourceTier};
use crate::cli::CliInputs;
use crate::error::{PluginLoadError, SdkResult, SupervisionError, UsageError};
use crate::supervisor::{LaunchCommand, LaunchSpec};

/// A command run by `install` or `reset`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Step {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    /// Skip the step when this path exists
    pub unless_exists: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StartSection {
    pub program: String,
    pub args: Vec<String>,
    /// Replaces `args` under `--gui`
    pub gui_args: Option<Vec<String>>,
    pub cwd: Option<String>,
    /// Defaults; a variable already set in the caller's environment wins
    pub env: BTreeMap<String, String>,
    /// Directories created before launch
    pub create_dirs: Vec<String>,
    /// Refuse to start until `install` has produced `{location}`
    pub requires_source: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstallSection {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResetSection {
    pub clear_datadir: bool,
    pub steps: Vec<Step>,
}

impl Default for ResetSection {
    fn default() -> Self {
        Self {
            clear_datadir: true,
            steps: Vec::new(),
        }
    }
}

/// Extra CLI option declared by a manifest
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlagSpec {
    /// Argument id and placeholder name
    pub name: String,
    /// Long option; defaults to `name` with `_` replaced by `-`
    pub long: Option<String>,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub takes_value: bool,
    pub default: Option<String>,
    #[serde(default = "default_flag_verbs")]
    pub verbs: Vec<String>,
    /// Appended to the start command when the flag is set
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_flag_verbs() -> Vec<String> {
    vec!["start".to_string()]
}

impl FlagSpec {
    fn long(&self) -> String {
        self.long.clone().unwrap_or_else(|| self.name.replace('_', "-"))
    }

    fn arg(&self) -> Arg {
        let arg = Arg::new(self.name.clone())
            .long(self.long())
            .help(self.help.clone());
        if self.takes_value {
            match &self.default {
                Some(default) => arg.default_value(default.clone()),
                None => arg,
            }
        } else {
            arg.action(ArgAction::SetTrue)
        }
    }
}

/// Parsed `plugin.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub description: Option<String>,
    pub default_port: Option<u16>,
    pub reserved_ports: Vec<u16>,
    pub default_remote_repo: Option<String>,
    pub graceful_wait_secs: f64,
    /// Environment variable that overrides the allocated port
    pub port_env: Option<String>,
    pub status_endpoint: Option<String>,
    pub launch_mode: Option<LaunchMode>,
    /// Adds `--regtest` / `--testnet` to `start`
    pub network_flags: bool,
    pub start: Option<StartSection>,
    pub install: InstallSection,
    pub reset: ResetSection,
    pub metadata: BTreeMap<String, toml::Value>,
    pub flags: Vec<FlagSpec>,
}

impl Manifest {
    pub fn parse(text: &str, path: &Path) -> Result<Self, PluginLoadError> {
        toml::from_str(text).map_err(|e| PluginLoadError::InvalidManifest {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
    }

    fn flags_for<'a>(&'a self, verb: &'a str) -> impl Iterator<Item = &'a FlagSpec> + 'a {
        self.flags
            .iter()
            .filter(move |flag| flag.verbs.iter().any(|v| v == verb))
    }
}

/// Plugin driven by a [`Manifest`]
#[derive(Debug, Clone)]
pub struct ManifestPlugin {
    descriptor: PluginDescriptor,
    manifest: Manifest,
}

impl ManifestPlugin {
    pub fn new(name: &str, tier: SourceTier, manifest: Manifest, location: Option<PathBuf>) -> Self {
        let graceful_wait =
            Duration::try_from_secs_f64(manifest.graceful_wait_secs).unwrap_or(Duration::ZERO);
        let mut descriptor = PluginDescriptor::new(name, tier)
            .with_reserved_ports(manifest.reserved_ports.iter().copied())
            .with_graceful_wait(graceful_wait);
        if let Some(port) = manifest.default_port {
            descriptor = descriptor.with_default_port(port);
        }
        if let Some(repo) = &manifest.default_remote_repo {
            descriptor = descriptor.with_remote_repo(repo.clone());
        }
        if let Some(location) = location {
            descriptor = descriptor.with_location(location);
        }
        Self {
            descriptor,
            manifest,
        }
    }

    /// Load `<dir>/plugin.toml`
    pub fn from_dir(name: &str, tier: SourceTier, dir: &Path) -> Result<Self, PluginLoadError> {
        let path = dir.join(MANIFEST_FILENAME);
        if !path.is_file() {
            return Err(PluginLoadError::MissingPlugin {
                name: name.to_string(),
                path,
            });
        }
        let text = std::fs::read_to_string(&path)?;
        let manifest = Manifest::parse(&text, &path)?;
        Ok(Self::new(name, tier, manifest, Some(dir.to_path_buf())))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn extend(&self, verb: &str, mut cmd: Command) -> (Command, Vec<String>) {
        let mut ids = Vec::new();
        if verb == "start" && self.manifest.network_flags {
            for network in super::Network::FLAGS {
                cmd = cmd.arg(
                    Arg::new(network.as_str())
                        .long(network.as_str())
                        .action(ArgAction::SetTrue)
                        .help(format!("run on {}", network.as_str())),
                );
                ids.push(network.as_str().to_string());
            }
        }
        for flag in self.manifest.flags_for(verb) {
            cmd = cmd.arg(flag.arg());
            ids.push(flag.name.clone());
        }
        (cmd, ids)
    }

    fn vars(&self, ctx: &PluginContext<'_>, id: &str, alloc: Option<&Allocation>) -> Vars {
        let paths = ctx.app().paths();
        let mut vars = Vars::default();
        vars.set("id", id);
        vars.set("datadir", ctx.datadir(id).display());
        vars.set("location", ctx.source_dir().display());
        vars.set("logs", paths.component_logs_dir(ctx.component_type(), id).display());
        vars.set("sdk_home", paths.home.display());
        vars.set("repo", ctx.repo().unwrap_or_default());
        vars.set("branch", ctx.branch().unwrap_or_default());
        vars.set("python", python_program());
        vars.set("network", network_from_env().as_str());
        if let Some(port) = alloc.and_then(|a| a.port).or(self.manifest.default_port) {
            vars.set("port", port);
        }
        for flag in &self.manifest.flags {
            vars.set(&flag.name, extension_text(ctx.inputs(), &flag.name));
        }
        vars
    }

    async fn run_steps(&self, ctx: &PluginContext<'_>, steps: &[Step], vars: &Vars) -> SdkResult<()> {
        for step in steps {
            if let Some(marker) = &step.unless_exists {
                let marker = vars.render(marker);
                if Path::new(&marker).exists() {
                    debug!("Skipping '{}': {} exists", step.program, marker);
                    continue;
                }
            }
            let program = vars.render(&step.program);
            let args: Vec<String> = step.args.iter().map(|a| vars.render(a)).collect();
            let cwd = step
                .cwd
                .as_deref()
                .map(|c| PathBuf::from(vars.render(c)))
                .unwrap_or_else(|| ctx.app().paths().remote_repos.clone());
            std::fs::create_dir_all(&cwd)?;

            info!("Running {} {}", program, args.join(" "));
            let status = tokio::process::Command::new(&program)
                .args(&args)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .status()
                .await
                .map_err(|source| SupervisionError::Spawn {
                    program: program.clone(),
                    source,
                })?;
            if !status.success() {
                return Err(SupervisionError::ExitedNonZero {
                    id: ctx.component_type().to_string(),
                    code: status.code().unwrap_or(-1),
                }
                .into());
            }
        }
        Ok(())
    }

    fn build_launch(
        &self,
        ctx: &PluginContext<'_>,
        start: &StartSection,
        alloc: &Allocation,
        vars: &Vars,
    ) -> SdkResult<LaunchSpec> {
        let inputs = ctx.inputs();
        let template = match (&start.gui_args, inputs.gui_flag) {
            (Some(gui), true) => gui,
            _ => &start.args,
        };
        let mut args: Vec<String> = template.iter().map(|a| vars.render(a)).collect();
        for flag in self.manifest.flags_for("start") {
            if is_set(inputs.cli_extension_args.get(&flag.name)) {
                args.extend(flag.args.iter().map(|a| vars.render(a)));
            }
        }
        args.extend(inputs.component_args.iter().cloned());

        let mut env = BTreeMap::new();
        for (key, value) in &start.env {
            if std::env::var_os(key).is_none() {
                env.insert(key.clone(), vars.render(value));
            }
        }

        for dir in &start.create_dirs {
            std::fs::create_dir_all(vars.render(dir))?;
        }

        let location = ctx.source_dir();
        let mut record = ComponentRecord::new(&alloc.id, ctx.component_type())
            .with_metadata(keys::DATADIR, alloc.datadir.display().to_string());
        if location.exists() {
            record = record.with_location(&location);
        }
        if let Some(port) = alloc.port {
            record = record.with_metadata("port", port);
        }
        if let Some(endpoint) = &self.manifest.status_endpoint {
            record = record.with_status_endpoint(vars.render(endpoint));
        }
        for (key, value) in &self.manifest.metadata {
            record = record.with_metadata(key.clone(), toml_to_json(value, vars));
        }

        let cwd = start.cwd.as_deref().map(|c| PathBuf::from(vars.render(c)));
        let command = LaunchCommand::new(vars.render(&start.program))
            .with_args(args)
            .with_env(env);
        let command = match cwd {
            Some(cwd) => command.with_cwd(cwd),
            None => command,
        };
        Ok(LaunchSpec::new(command, record, ctx.log_file(&alloc.id)?))
    }
}

#[async_trait]
impl Plugin for ManifestPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn extend_start_cli(&self, cmd: Command) -> (Command, Vec<String>) {
        self.extend("start", cmd)
    }

    fn extend_reset_cli(&self, cmd: Command) -> (Command, Vec<String>) {
        self.extend("reset", cmd)
    }

    async fn install(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        if self.manifest.install.steps.is_empty() {
            info!("Nothing to install for {}", ctx.component_type());
            return Ok(());
        }
        let id = crate::allocator::default_component_id(ctx.component_type());
        let vars = self.vars(ctx, &id, None);
        self.run_steps(ctx, &self.manifest.install.steps, &vars).await?;
        info!("Installed {}", ctx.component_type());
        Ok(())
    }

    async fn start(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        let Some(start) = &self.manifest.start else {
            warn!("{} declares no start command", ctx.component_type());
            return Ok(());
        };

        let location = ctx.source_dir();
        if start.requires_source && !location.exists() {
            return Err(UsageError::InvalidArgs(format!(
                "source directory {} does not exist - try 'electrumsv-sdk install {}' first",
                location.display(),
                ctx.component_type()
            ))
            .into());
        }

        let network = if self.manifest.network_flags {
            ctx.network()?
        } else {
            network_from_env()
        };

        let mut alloc = ctx.allocate()?;
        if let Some(port) = self
            .manifest
            .port_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .and_then(|value| value.parse().ok())
        {
            alloc.port = Some(port);
        }

        let mut vars = self.vars(ctx, &alloc.id, Some(&alloc));
        vars.set("network", network.as_str());

        let spec = self.build_launch(ctx, start, &alloc, &vars)?;
        let mode = ctx.launch_mode(self.manifest.launch_mode.unwrap_or(LaunchMode::NewTerminal));
        let record = ctx.launch(spec, mode).await?;
        if mode != LaunchMode::Inline {
            ctx.confirm_running(&record).await?;
        }
        Ok(())
    }

    async fn reset(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        for id in ctx.target_ids()? {
            if let Some(record) = ctx.app().registry().get_by_id(&id)? {
                ctx.stop_record(&record).await?;
            }
            if self.manifest.reset.clear_datadir {
                ctx.wipe_datadir(&id)?;
            }
            let vars = self.vars(ctx, &id, None);
            self.run_steps(ctx, &self.manifest.reset.steps, &vars).await?;
        }
        info!("Reset of {} completed", ctx.component_type());
        Ok(())
    }
}

/// `{name}` substitution table
#[derive(Debug, Default, Clone)]
pub struct Vars(BTreeMap<String, String>);

impl Vars {
    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.0.insert(key.to_string(), value.to_string());
    }

    /// Replace known `{name}` placeholders; unknown ones are left as written
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if self.0.contains_key(&after[..close]) => {
                    out.push_str(&self.0[&after[..close]]);
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn python_program() -> &'static str {
    if cfg!(windows) { "python" } else { "python3" }
}

fn is_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

fn extension_text(inputs: &CliInputs, name: &str) -> String {
    match inputs.cli_extension_args.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn toml_to_json(value: &toml::Value, vars: &Vars) -> Value {
    match value {
        toml::Value::String(s) => Value::String(vars.render(s)),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => Value::from(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        other => Value::String(other.to_string()),
    }
}
