//! Launches in a new terminal window
//!
//! The terminal runs `electrumsv-sdk-runner inline`, which opens the sealed environment
//! file and supervises the component with its log echoed to the window.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use sdk_core::{ComponentRecord, ComponentState, LaunchMode, Registry, SdkPaths};

use super::background::runner_args;
use super::{LaunchCommand, LaunchSpec, envfile, inline, record_failed_launch, wait_for_commit};
use crate::error::{SdkResult, SupervisionError};
use crate::util::quote;

/// How long the CLI waits for the terminal's runner to record the spawn
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Platform command that opens a terminal running `program args...`
pub fn terminal_command(program: &str, args: &[String]) -> Result<LaunchCommand, SupervisionError> {
    if cfg!(target_os = "macos") {
        let words = std::iter::once(program).chain(args.iter().map(String::as_str));
        let script = quote::terminal_do_script(&quote::shell_join(words)?);
        Ok(LaunchCommand::new("osascript").with_args(vec!["-e".to_string(), script]))
    } else if cfg!(windows) {
        let mut cmd_args = vec!["/c".to_string(), program.to_string()];
        cmd_args.extend(args.iter().cloned());
        Ok(LaunchCommand::new("cmd").with_args(cmd_args))
    } else {
        let mut xterm_args = vec![
            "-fa".to_string(),
            "Monospace".to_string(),
            "-fs".to_string(),
            "10".to_string(),
            "-e".to_string(),
            program.to_string(),
        ];
        xterm_args.extend(args.iter().cloned());
        Ok(LaunchCommand::new("xterm").with_args(xterm_args))
    }
}

/// Open a terminal running the runner for `spec` and wait for its first commit
pub async fn launch(
    runner: &Path,
    registry: &Registry,
    paths: &SdkPaths,
    spec: LaunchSpec,
) -> SdkResult<ComponentRecord> {
    let id = spec.record.id.clone();
    let env_file = envfile::env_file_path(paths, &spec.record.component_type, &id);
    let key = envfile::write_encrypted(&env_file, &spec.command.env)?;

    let mut args = vec!["inline".to_string()];
    args.extend(runner_args(registry, &spec)?);
    args.extend([
        "--env-file".to_string(),
        env_file.display().to_string(),
        "--key".to_string(),
        key,
    ]);
    let terminal = terminal_command(&runner.display().to_string(), &args)?;

    #[cfg_attr(not(windows), allow(unused_mut))]
    let mut cmd = terminal.to_command();
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Threading::CREATE_NEW_CONSOLE;
        cmd.creation_flags(CREATE_NEW_CONSOLE);
    }

    let since = Utc::now();
    if let Err(source) = cmd.spawn() {
        discard_env_file(&env_file);
        record_failed_launch(registry, spec.record)?;
        return Err(SupervisionError::NoTerminal(format!("{}: {}", terminal.program, source)).into());
    }
    debug!(component_id = %id, "Terminal opened with {}", terminal.program);

    match wait_for_commit(registry, &id, since, COMMIT_TIMEOUT).await? {
        Some(record) => Ok(record),
        None => {
            error!(component_id = %id, "No state recorded for {} within {:?}", id, COMMIT_TIMEOUT);
            discard_env_file(&env_file);
            record_failed_launch(registry, spec.record)?;
            Err(SupervisionError::CommitTimeout(id).into())
        }
    }
}

/// Remove a sealed environment the runner never consumed
fn discard_env_file(env_file: &Path) {
    match std::fs::remove_file(env_file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} was already consumed", env_file.display());
        }
        Err(e) => warn!("Failed to delete {}: {}", env_file.display(), e),
    }
}

/// Runner side: open the sealed environment, then supervise with the log echoed.
///
/// A missing or undecryptable environment records `Failed` and never spawns.
pub async fn run(
    registry: &Registry,
    mut command: LaunchCommand,
    record: ComponentRecord,
    log_file: &Path,
    env_file: Option<(&Path, &str)>,
) -> SdkResult<i32> {
    if let Some((path, key)) = env_file {
        match envfile::read_and_delete(path, key) {
            Ok(env) => command.env.extend(env),
            Err(e) => {
                registry.upsert(record.with_state(ComponentState::Failed))?;
                return Err(e.into());
            }
        }
    }
    inline::supervise(registry, &command, record, log_file, LaunchMode::NewTerminal, true).await
}
