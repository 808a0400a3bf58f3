//! ElectrumSV SDK command line

use std::process::ExitCode;

use tracing::{debug, error};

use electrumsv_sdk::cli::{self, Namespace};
use electrumsv_sdk::error::UsageError;
use electrumsv_sdk::{AppState, Controller, SdkError};
use sdk_core::logging::{DEFAULT_FILTER, init_tracing};

fn main() -> ExitCode {
    init_tracing(DEFAULT_FILTER);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(run()) {
        Ok(()) => 0,
        Err(SdkError::Usage(UsageError::Display(text))) => {
            println!("{text}");
            0
        }
        Err(SdkError::Usage(e)) => {
            eprintln!("{e}");
            1
        }
        Err(SdkError::Interrupted) => 130,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run() -> Result<(), SdkError> {
    let app = AppState::bootstrap()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let inputs = cli::parse(&args, app.plugins())?;
    debug!(?inputs, "Parsed command line");

    let controller = Controller::new(app);
    if inputs.namespace != Namespace::TopLevel {
        controller.handle_first_run().await?;
    }

    tokio::select! {
        result = controller.dispatch(&inputs) => result,
        _ = shutdown_signal(inputs.namespace) => Err(SdkError::Interrupted),
    }
}

/// Ctrl-C for verbs that do not supervise a child themselves.
///
/// An inline start forwards the interrupt to its child and keeps waiting, so the
/// signal must not cancel it here.
async fn shutdown_signal(namespace: Namespace) {
    if namespace == Namespace::Start {
        return std::future::pending().await;
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
