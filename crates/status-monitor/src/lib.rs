//! Status Monitor
//!
//! Long-lived sidecar that tails the component registry and pushes every changed
//! record to websocket subscribers.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use sdk_core::{Registry, RegistryError};

pub mod server;
pub mod watcher;

pub use server::{AppState, HeartbeatConfig, HeartbeatMode, StatusFrame, create_router};
pub use watcher::{REFRESH_INTERVAL, RegistryWatcher};

/// Default listening port
pub const SERVER_PORT: u16 = 56565;

/// Errors raised while running the monitor
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid bind address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Monitor settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub host: String,
    pub port: u16,
    pub refresh_interval: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: SERVER_PORT,
            refresh_interval: REFRESH_INTERVAL,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(
    config: MonitorConfig,
    registry: Registry,
    shutdown: F,
) -> Result<(), MonitorError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let initial = {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || registry.get_all())
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??
    };
    info!("Loaded {} component records", initial.len());

    let state = AppState::new(registry, initial, config.heartbeat);
    let watcher = RegistryWatcher::new(state.clone(), config.refresh_interval);
    let watcher_handle = tokio::spawn(watcher.run());

    let app = create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Status monitor listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    watcher_handle.abort();
    info!("Status monitor shutdown complete");
    result.map_err(MonitorError::from)
}
