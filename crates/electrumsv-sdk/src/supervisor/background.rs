//! Detached launches supervised by `electrumsv-sdk-runner background`

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error};

use sdk_core::{ComponentRecord, LaunchMode, Registry};

use super::{LaunchCommand, LaunchSpec, inline, payload, record_failed_launch, wait_for_commit};
use crate::error::{SdkResult, SupervisionError};

/// How long the CLI waits for the runner to record the spawn
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runner arguments shared by background and new-terminal launches
pub(crate) fn runner_args(registry: &Registry, spec: &LaunchSpec) -> Result<Vec<String>, SupervisionError> {
    Ok(vec![
        "--registry".to_string(),
        registry.path().display().to_string(),
        "--log-file".to_string(),
        spec.log_file.display().to_string(),
        "--command".to_string(),
        payload::encode(&spec.command.without_env())?,
        "--component-info".to_string(),
        payload::encode(&spec.record)?,
    ])
}

/// Spawn a detached runner for `spec` and wait for its first commit
pub async fn launch(runner: &Path, registry: &Registry, spec: LaunchSpec) -> SdkResult<ComponentRecord> {
    let id = spec.record.id.clone();
    let mut args = vec!["background".to_string()];
    args.extend(runner_args(registry, &spec)?);

    let mut cmd = tokio::process::Command::new(runner);
    cmd.args(&args)
        .envs(&spec.command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};
        cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    }

    let since = Utc::now();
    if let Err(source) = cmd.spawn() {
        record_failed_launch(registry, spec.record)?;
        return Err(SupervisionError::Spawn {
            program: runner.display().to_string(),
            source,
        }
        .into());
    }
    debug!(component_id = %id, "Background runner spawned");

    match wait_for_commit(registry, &id, since, COMMIT_TIMEOUT).await? {
        Some(record) => Ok(record),
        None => {
            error!(component_id = %id, "No state recorded for {} within {:?}", id, COMMIT_TIMEOUT);
            record_failed_launch(registry, spec.record)?;
            Err(SupervisionError::CommitTimeout(id).into())
        }
    }
}

/// Runner side: supervise the decoded command until it exits
pub async fn run(
    registry: &Registry,
    command: &LaunchCommand,
    record: ComponentRecord,
    log_file: &Path,
) -> SdkResult<i32> {
    inline::supervise(registry, command, record, log_file, LaunchMode::Background, false).await
}
