//! Supervise a child in the current process

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tracing::{info, warn};

use sdk_core::record::keys;
use sdk_core::{ComponentRecord, ComponentState, LaunchMode, Registry};

use super::LaunchCommand;
use crate::error::{SdkResult, SupervisionError};
use crate::util::LogTail;

/// Spawn `command`, record it and wait for it to exit.
///
/// Output goes to `log_file` (appended); with `echo` the file is followed to stdout.
/// Ctrl-C is forwarded to the child instead of ending the wait. Returns the exit code,
/// `128 + signal` for signal deaths.
pub async fn supervise(
    registry: &Registry,
    command: &LaunchCommand,
    record: ComponentRecord,
    log_file: &Path,
    mode: LaunchMode,
    echo: bool,
) -> SdkResult<i32> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = OpenOptions::new().create(true).append(true).open(log_file)?;
    let stderr = stdout.try_clone()?;

    let mut cmd = command.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    cmd.process_group(0);

    let record = record
        .with_metadata(keys::LAUNCH_MODE, mode.as_str())
        .with_logging_path(log_file);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            registry.upsert(record.with_state(ComponentState::Failed))?;
            return Err(SupervisionError::Spawn {
                program: command.program.clone(),
                source,
            }
            .into());
        }
    };

    let pid = child.id();
    let id = record.id.clone();
    let mut running = record.with_state(ComponentState::Running);
    running.pid = pid;
    registry.upsert(running)?;
    info!(component_id = %id, pid = ?pid, "{} is running, logging to {}", id, log_file.display());

    let tail = echo.then(|| LogTail::spawn(log_file));

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    break child.wait().await?;
                }
                info!(component_id = %id, "Interrupt received, forwarding to {}", id);
                if let Some(pid) = pid {
                    forward_interrupt(pid);
                }
            }
        }
    };

    let code = exit_code(status);
    let state = ComponentState::from_exit_code(code);
    registry.transition(&id, pid, state)?;
    if let Some(tail) = tail {
        tail.finish();
    }
    info!(component_id = %id, code, state = %state, "{} exited", id);
    Ok(code)
}

/// Exit code, or `128 + signal` when killed by a signal
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn forward_interrupt(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGINT) {
            warn!(pid, "Failed to forward interrupt: {}", e);
        }
    }
}

// the child shares our console and receives the Ctrl-C itself
#[cfg(not(unix))]
fn forward_interrupt(_pid: u32) {}
