//! Status Monitor State
//!
//! Shared state accessible by all websocket handlers and the registry watcher.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;
use wildmatch::WildMatch;

use sdk_core::{ComponentRecord, Registry, Snapshot};

use super::protocol::{HeartbeatConfig, StatusFrame};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Registry being observed
    registry: Registry,

    /// Last snapshot seen by the watcher
    snapshot: RwLock<Snapshot>,

    /// Connected clients
    clients: DashMap<Uuid, ClientState>,

    heartbeat: HeartbeatConfig,
}

/// Per-client state
#[derive(Debug, Clone)]
pub struct ClientState {
    pub session_id: Uuid,

    /// Only ids matching this pattern receive change frames
    pub filter: Option<WildMatch>,

    /// Channel to send frames to this client
    pub tx: mpsc::Sender<StatusFrame>,
}

impl ClientState {
    fn wants(&self, id: &str) -> bool {
        self.filter.as_ref().is_none_or(|pattern| pattern.matches(id))
    }
}

impl AppState {
    pub fn new(registry: Registry, initial: Snapshot, heartbeat: HeartbeatConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                snapshot: RwLock::new(initial),
                clients: DashMap::new(),
                heartbeat,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        self.inner.heartbeat
    }

    /// Last snapshot recorded by the watcher
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.read().clone()
    }

    /// Replace the cached snapshot, returning the previous one
    pub fn replace_snapshot(&self, snapshot: Snapshot) -> Snapshot {
        std::mem::replace(&mut *self.inner.snapshot.write(), snapshot)
    }

    /// Register a new client connection
    pub fn register_client(&self, filter: Option<&str>, tx: mpsc::Sender<StatusFrame>) -> Uuid {
        let session_id = Uuid::new_v4();
        let client = ClientState {
            session_id,
            filter: filter.map(WildMatch::new),
            tx,
        };
        self.inner.clients.insert(session_id, client);
        tracing::info!(%session_id, "Client connected");
        session_id
    }

    pub fn remove_client(&self, session_id: Uuid) {
        self.inner.clients.remove(&session_id);
        tracing::info!(%session_id, "Client disconnected");
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Push one changed record to every interested client
    pub async fn broadcast_change(&self, record: &ComponentRecord) {
        // Collect senders first; DashMap guards must not be held across await
        let targets: Vec<_> = self
            .inner
            .clients
            .iter()
            .filter(|client| client.wants(&record.id))
            .map(|client| (client.session_id, client.tx.clone()))
            .collect();

        for (session_id, tx) in targets {
            if tx.send(StatusFrame::change(record.clone())).await.is_err() {
                tracing::debug!(%session_id, "Dropping frame for closed client");
            }
        }
    }
}
