//! Launching and stopping component processes
//!
//! Three launch modes share one supervision loop ([`inline::supervise`]):
//!
//! - inline: the CLI itself supervises the child and echoes its log
//! - background: a detached `electrumsv-sdk-runner background` supervises it
//! - new terminal: a terminal window runs `electrumsv-sdk-runner inline`
//!
//! Whoever supervises the child commits `Running` after spawn and exactly one terminal
//! state after exit.

pub mod background;
pub mod envfile;
pub mod inline;
pub mod kill;
pub mod liveness;
pub mod terminal;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sdk_core::{ComponentRecord, ComponentState, LaunchMode, Registry, SdkPaths};

use crate::error::{SdkResult, SupervisionError};

pub use kill::{InterruptStrategy, KillOutcome, kill_tree};
pub use liveness::{LivenessConfig, is_running_http};

/// Helper binary that supervises background and new-terminal launches
pub const RUNNER_NAME: &str = "electrumsv-sdk-runner";

/// How long `stop` waits for a supervisor to commit the exit
const STOP_COMMIT_WAIT: Duration = Duration::from_secs(2);

const COMMIT_POLL: Duration = Duration::from_millis(100);

/// Program, arguments, environment and working directory of a component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Same command without its environment, for command-line payloads
    pub fn without_env(&self) -> Self {
        Self {
            env: BTreeMap::new(),
            ..self.clone()
        }
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Human readable form for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything needed to launch one component instance
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub command: LaunchCommand,
    /// Record skeleton; pid and state are filled in by the supervisor
    pub record: ComponentRecord,
    pub log_file: PathBuf,
}

impl LaunchSpec {
    pub fn new(command: LaunchCommand, record: ComponentRecord, log_file: impl Into<PathBuf>) -> Self {
        Self {
            command,
            record,
            log_file: log_file.into(),
        }
    }
}

/// Base64 JSON used to pass commands and records on a command line
pub mod payload {
    use super::*;

    pub fn encode<T: Serialize>(value: &T) -> Result<String, SupervisionError> {
        let json = serde_json::to_vec(value).map_err(|e| SupervisionError::Payload(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, SupervisionError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| SupervisionError::Payload(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| SupervisionError::Payload(e.to_string()))
    }
}

/// Starts components in the requested [`LaunchMode`]
#[derive(Debug, Clone)]
pub struct Launcher {
    runner: PathBuf,
}

impl Launcher {
    pub fn new(runner: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.into(),
        }
    }

    /// Runner next to the current executable, else whatever PATH provides
    pub fn locate() -> Self {
        let exe_name = format!("{RUNNER_NAME}{}", std::env::consts::EXE_SUFFIX);
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            let candidate = dir.join(&exe_name);
            if candidate.exists() {
                return Self::new(candidate);
            }
        }
        Self::new(exe_name)
    }

    pub fn runner(&self) -> &Path {
        &self.runner
    }

    /// Launch `spec` and return the record as committed by its supervisor
    pub async fn launch(
        &self,
        registry: &Registry,
        paths: &SdkPaths,
        spec: LaunchSpec,
        mode: LaunchMode,
    ) -> SdkResult<ComponentRecord> {
        let id = spec.record.id.clone();
        info!(
            component_id = %id,
            mode = mode.as_str(),
            "Launching {}: {}",
            id,
            spec.command.display()
        );
        match mode {
            LaunchMode::Inline => {
                let code = inline::supervise(
                    registry,
                    &spec.command,
                    spec.record,
                    &spec.log_file,
                    mode,
                    true,
                )
                .await?;
                let record = registry
                    .get_by_id(&id)?
                    .ok_or_else(|| SupervisionError::CommitTimeout(id.clone()))?;
                if record.component_state == ComponentState::Failed {
                    return Err(SupervisionError::ExitedNonZero { id, code }.into());
                }
                Ok(record)
            }
            LaunchMode::Background => {
                let record = background::launch(&self.runner, registry, spec).await?;
                ensure_launched(record)
            }
            LaunchMode::NewTerminal => {
                let record = terminal::launch(&self.runner, registry, paths, spec).await?;
                ensure_launched(record)
            }
        }
    }
}

/// A runner that could not spawn the child (or open its environment) commits `Failed`
fn ensure_launched(record: ComponentRecord) -> SdkResult<ComponentRecord> {
    if record.component_state == ComponentState::Failed {
        return Err(SupervisionError::LaunchFailed(record.id).into());
    }
    Ok(record)
}

/// Wait for the record of `id` to be committed after `since` and leave `None`
pub(crate) async fn wait_for_commit(
    registry: &Registry,
    id: &str,
    since: chrono::DateTime<chrono::Utc>,
    timeout: Duration,
) -> SdkResult<Option<ComponentRecord>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(record) = registry.get_by_id(id)? {
            if record.last_updated > since && record.component_state != ComponentState::None {
                return Ok(Some(record));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(COMMIT_POLL).await;
    }
}

/// Record a launch that never produced a supervised process
pub(crate) fn record_failed_launch(registry: &Registry, record: ComponentRecord) -> SdkResult<()> {
    registry.upsert(record.with_state(ComponentState::Failed))?;
    Ok(())
}

/// Stop one component: kill its process tree and settle the record.
///
/// Returns `None` when the record was already terminal or had no pid.
pub async fn stop_component(
    registry: &Registry,
    record: &ComponentRecord,
    graceful_wait: Duration,
) -> SdkResult<Option<KillOutcome>> {
    if record.component_state.is_terminal() {
        debug!(component_id = %record.id, "{} is already {}", record.id, record.component_state);
        return Ok(None);
    }
    let Some(pid) = record.pid else {
        registry.transition(&record.id, None, ComponentState::Stopped)?;
        return Ok(None);
    };

    let strategy = InterruptStrategy::for_launch(record.launch_mode(), default_runner());
    let before = record.last_updated;
    let outcome = kill_tree(pid, graceful_wait, &strategy).await;

    // a live supervisor commits the exit code itself; otherwise settle here
    let committed = wait_for_terminal(registry, &record.id, before, STOP_COMMIT_WAIT).await?;
    if !committed {
        if registry.transition(&record.id, Some(pid), ComponentState::Stopped)? {
            debug!(component_id = %record.id, "Committed Stopped for {}", record.id);
        } else {
            warn!(component_id = %record.id, "Record {} changed while stopping", record.id);
        }
    }
    Ok(Some(outcome))
}

async fn wait_for_terminal(
    registry: &Registry,
    id: &str,
    since: chrono::DateTime<chrono::Utc>,
    timeout: Duration,
) -> SdkResult<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        match registry.get_by_id(id)? {
            Some(record) if record.last_updated > since && record.component_state.is_terminal() => {
                return Ok(true);
            }
            None => return Ok(true),
            _ => {}
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(COMMIT_POLL).await;
    }
}

fn default_runner() -> PathBuf {
    Launcher::locate().runner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_url_safe() {
        let command = LaunchCommand::new("/usr/bin/python3")
            .with_args(vec!["server.py".into(), "--flag=a b/c+d?".into()])
            .with_cwd("/tmp");
        let encoded = payload::encode(&command).unwrap();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        let decoded: LaunchCommand = payload::decode(&encoded).unwrap();
        assert_eq!(decoded, command);
        assert!(matches!(
            payload::decode::<LaunchCommand>("!!!"),
            Err(SupervisionError::Payload(_))
        ));
    }

    #[test]
    fn test_without_env_strips_secrets() {
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        let command = LaunchCommand::new("server").with_env(env);
        assert!(command.without_env().env.is_empty());
        assert_eq!(command.without_env().program, "server");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_failed_commit_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let paths = SdkPaths::at(temp.path().join("home"), temp.path(), temp.path());
        let registry = Registry::new(temp.path().join("component_state.json"));

        // stands in for a runner that could not spawn its child
        let writer = registry.clone();
        let committer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            writer
                .upsert(ComponentRecord::new("bad1", "bad").with_state(ComponentState::Failed))
                .unwrap();
        });

        let spec = LaunchSpec::new(
            LaunchCommand::new("missing-binary"),
            ComponentRecord::new("bad1", "bad"),
            temp.path().join("bad.log"),
        );
        let result = Launcher::new("true")
            .launch(&registry, &paths, spec, LaunchMode::Background)
            .await;
        committer.await.unwrap();
        assert!(matches!(
            result,
            Err(crate::error::SdkError::Supervision(SupervisionError::LaunchFailed(ref id))) if id == "bad1"
        ));
    }

    #[test]
    fn test_running_commit_is_accepted() {
        let record = ComponentRecord::new("ok1", "ok").with_state(ComponentState::Running);
        assert_eq!(ensure_launched(record).unwrap().id, "ok1");
    }

    #[tokio::test]
    async fn test_stop_terminal_record_is_noop() {
        let temp = tempfile::tempdir().unwrap();
        let registry = Registry::new(temp.path().join("component_state.json"));
        let record = registry
            .upsert(ComponentRecord::new("node1", "node").with_state(ComponentState::Stopped))
            .unwrap();
        let outcome = stop_component(&registry, &record, Duration::ZERO).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_stop_without_pid_marks_stopped() {
        let temp = tempfile::tempdir().unwrap();
        let registry = Registry::new(temp.path().join("component_state.json"));
        let record = registry
            .upsert(ComponentRecord::new("esv1", "electrumsv").with_state(ComponentState::Running))
            .unwrap();
        stop_component(&registry, &record, Duration::ZERO).await.unwrap();
        assert_eq!(
            registry.get_by_id("esv1").unwrap().unwrap().component_state,
            ComponentState::Stopped
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_orphaned_process_commits_stopped() {
        let temp = tempfile::tempdir().unwrap();
        let registry = Registry::new(temp.path().join("component_state.json"));
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let record = registry
            .upsert(
                ComponentRecord::new("sleeper1", "sleeper")
                    .with_pid(pid)
                    .with_state(ComponentState::Running),
            )
            .unwrap();

        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = stop_component(&registry, &record, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.interrupted.contains(&pid) || outcome.already_gone.contains(&pid));
        reaper.await.unwrap().unwrap();
        assert_eq!(
            registry.get_by_id("sleeper1").unwrap().unwrap().component_state,
            ComponentState::Stopped
        );
    }
}
