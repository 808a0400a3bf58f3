//! Tracing setup shared by the SDK binaries

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log level override honoured before `RUST_LOG`
pub const SDK_LOG_LEVEL_ENV: &str = "SDK_LOG_LEVEL";

/// Set to `json` for machine-readable log lines
pub const SDK_LOG_FORMAT_ENV: &str = "SDK_LOG_FORMAT";

/// Default filter directives when neither env variable is set
pub const DEFAULT_FILTER: &str =
    "electrumsv_sdk=info,sdk_core=info,sdk_runner=info,status_monitor=info,tower_http=info";

fn env_filter(default_filter: &str) -> EnvFilter {
    if let Ok(level) = std::env::var(SDK_LOG_LEVEL_ENV) {
        if let Ok(filter) = EnvFilter::try_new(level.to_lowercase()) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Safe to call once per process.
pub fn init_tracing(default_filter: &str) {
    let filter = env_filter(default_filter);
    let json = std::env::var(SDK_LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
