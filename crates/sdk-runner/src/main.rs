//! ElectrumSV SDK Runner
//!
//! Helper binary re-entered by the SDK for launches that outlive the CLI process:
//! - `inline`: supervise a component in a freshly opened terminal
//! - `background`: supervise a detached component
//! - `status-monitor`: serve the registry over HTTP and websocket
//! - `console-ctrl`: raise Ctrl-C in another process's console (Windows)

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use electrumsv_sdk::supervisor::{LaunchCommand, background, payload, terminal};
use sdk_core::logging::{DEFAULT_FILTER, init_tracing};
use sdk_core::{ComponentRecord, Registry};
use status_monitor::{HeartbeatConfig, HeartbeatMode, MonitorConfig, SERVER_PORT};

/// ElectrumSV SDK process runner
#[derive(Parser, Debug)]
#[command(name = "electrumsv-sdk-runner")]
#[command(about = "Supervises components launched by electrumsv-sdk", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: RunnerCommand,
}

#[derive(Subcommand, Debug)]
enum RunnerCommand {
    /// Supervise a component with its log echoed to this terminal
    Inline {
        #[command(flatten)]
        launch: LaunchArgs,

        /// Sealed environment written by the SDK
        #[arg(long, requires = "key")]
        env_file: Option<PathBuf>,

        /// Key for the sealed environment
        #[arg(long, allow_hyphen_values = true)]
        key: Option<String>,
    },

    /// Supervise a detached component
    Background {
        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Run the status monitor server
    StatusMonitor {
        /// Server host address
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(long, default_value_t = SERVER_PORT)]
        port: u16,

        /// Registry file to tail
        #[arg(long)]
        registry: PathBuf,

        /// Send text "ping" messages instead of websocket Ping frames
        #[arg(long)]
        text_heartbeat: bool,
    },

    /// Deliver Ctrl-C to the console of a process (Windows only)
    ConsoleCtrl {
        /// Target process id
        pid: u32,
    },
}

/// What to launch and where to record it; payloads are base64 JSON
#[derive(clap::Args, Debug)]
struct LaunchArgs {
    /// Registry file
    #[arg(long)]
    registry: PathBuf,

    /// Log file for the component's output
    #[arg(long)]
    log_file: PathBuf,

    /// Encoded launch command
    #[arg(long, allow_hyphen_values = true)]
    command: String,

    /// Encoded component record
    #[arg(long, allow_hyphen_values = true)]
    component_info: String,
}

impl LaunchArgs {
    fn decode(&self) -> Result<(Registry, LaunchCommand, ComponentRecord)> {
        let command: LaunchCommand =
            payload::decode(&self.command).context("Invalid --command payload")?;
        let record: ComponentRecord =
            payload::decode(&self.component_info).context("Invalid --component-info payload")?;
        Ok((Registry::new(&self.registry), command, record))
    }
}

fn main() -> ExitCode {
    init_tracing(DEFAULT_FILTER);
    let args = Args::parse();

    let multi_thread = matches!(args.command, RunnerCommand::StatusMonitor { .. });
    let runtime = if multi_thread {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()
    } else {
        tokio::runtime::Builder::new_current_thread().enable_all().build()
    };
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args.command)) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: RunnerCommand) -> Result<i32> {
    match command {
        RunnerCommand::Inline {
            launch,
            env_file,
            key,
        } => {
            let (registry, command, record) = launch.decode()?;
            let sealed = match (env_file.as_deref(), key.as_deref()) {
                (Some(path), Some(key)) => Some((path, key)),
                _ => None,
            };
            let code = terminal::run(&registry, command, record, &launch.log_file, sealed).await?;
            Ok(code)
        }
        RunnerCommand::Background { launch } => {
            let (registry, command, record) = launch.decode()?;
            let code = background::run(&registry, &command, record, &launch.log_file).await?;
            Ok(code)
        }
        RunnerCommand::StatusMonitor {
            host,
            port,
            registry,
            text_heartbeat,
        } => {
            serve_status_monitor(host, port, &registry, text_heartbeat).await?;
            Ok(0)
        }
        RunnerCommand::ConsoleCtrl { pid } => console_ctrl(pid),
    }
}

async fn serve_status_monitor(host: String, port: u16, registry: &Path, text_heartbeat: bool) -> Result<()> {
    let mode = if text_heartbeat {
        HeartbeatMode::Text
    } else {
        HeartbeatMode::Protocol
    };
    let config = MonitorConfig::default()
        .with_host(host)
        .with_port(port)
        .with_heartbeat(HeartbeatConfig::default().with_mode(mode));
    info!(registry = %registry.display(), "Starting status monitor");
    status_monitor::serve(config, Registry::new(registry), shutdown_signal()).await?;
    Ok(())
}

#[cfg(windows)]
fn console_ctrl(pid: u32) -> Result<i32> {
    electrumsv_sdk::supervisor::kill::send_console_ctrl_c(pid)
        .with_context(|| format!("Failed to send Ctrl-C to {pid}"))?;
    Ok(0)
}

#[cfg(not(windows))]
fn console_ctrl(pid: u32) -> Result<i32> {
    anyhow::bail!("console-ctrl is only available on Windows (pid {pid})")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
