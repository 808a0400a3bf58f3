//! Registry Watcher
//!
//! Polls the registry file on a fixed interval and diffs it by `id` and
//! `last_updated`. A filesystem watcher on the registry's directory wakes the loop
//! early when the file is replaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sdk_core::{ComponentRecord, Snapshot};

use crate::server::AppState;

/// Default polling interval
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Records in `new` that are absent from `old` or carry a different `last_updated`
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<ComponentRecord> {
    new.iter()
        .filter(|(id, record)| {
            old.get(*id)
                .is_none_or(|previous| previous.last_updated != record.last_updated)
        })
        .map(|(_, record)| record.clone())
        .collect()
}

/// Registry change watcher
pub struct RegistryWatcher {
    state: AppState,
    interval: Duration,
    /// Early-wake notifications from the filesystem watcher
    rx: mpsc::Receiver<()>,
    /// The underlying watcher (kept alive)
    _watcher: Option<RecommendedWatcher>,
}

impl RegistryWatcher {
    /// Create a watcher for the registry held by `state`.
    ///
    /// Falls back to polling alone if the filesystem watcher cannot be set up.
    pub fn new(state: AppState, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let registry_file = state.registry().path().to_path_buf();

        let watcher = match Self::watch_file(&registry_file, tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Registry file watcher unavailable, polling only: {}", e);
                None
            }
        };

        Self {
            state,
            interval,
            rx,
            _watcher: watcher,
        }
    }

    fn watch_file(
        registry_file: &Path,
        tx: mpsc::Sender<()>,
    ) -> Result<RecommendedWatcher, notify::Error> {
        let dir = registry_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(notify::Error::io)?;

        let target = registry_file.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_)
                    ) && event.paths.iter().any(|p| p == &target);
                    if relevant {
                        // A full channel already holds a pending wake-up
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => warn!("Registry watcher error: {}", e),
            }
        })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching registry file: {}", registry_file.display());
        Ok(watcher)
    }

    /// Read the registry and broadcast changed records. Returns the number broadcast.
    pub async fn poll(&self) -> usize {
        let registry = self.state.registry().clone();
        let snapshot = match tokio::task::spawn_blocking(move || registry.get_all()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!("Failed to read registry: {}", e);
                return 0;
            }
            Err(e) => {
                warn!("Registry read task failed: {}", e);
                return 0;
            }
        };

        let previous = self.state.replace_snapshot(snapshot.clone());
        let changed = diff(&previous, &snapshot);
        for record in &changed {
            debug!(
                component_id = %record.id,
                state = %record.component_state,
                "Registry change"
            );
            self.state.broadcast_change(record).await;
        }
        changed.len()
    }

    /// Run the watcher loop
    pub async fn run(mut self) {
        info!("Starting registry watcher loop");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut wake_enabled = self._watcher.is_some();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                wake = self.rx.recv(), if wake_enabled => {
                    if wake.is_none() {
                        // Watcher gone; keep polling on the interval
                        wake_enabled = false;
                    }
                }
            }
            self.poll().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HeartbeatConfig;
    use sdk_core::{ComponentState, Registry};
    use tempfile::TempDir;

    #[test]
    fn test_diff_by_last_updated() {
        let a = ComponentRecord::new("node1", "node");
        let mut old = Snapshot::new();
        old.insert(a.id.clone(), a.clone());

        let mut new = old.clone();
        assert!(diff(&old, &new).is_empty());

        let mut changed = a.clone();
        changed.last_updated += chrono::TimeDelta::milliseconds(5);
        new.insert(changed.id.clone(), changed);
        new.insert("node2".into(), ComponentRecord::new("node2", "node"));

        let ids: Vec<_> = diff(&old, &new).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["node1".to_string(), "node2".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_produces_exactly_one_frame() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path().join("component_state.json"));
        registry
            .upsert(
                ComponentRecord::new("node1", "node")
                    .with_pid(55)
                    .with_state(ComponentState::Running),
            )
            .unwrap();

        let initial = registry.get_all().unwrap();
        let state = AppState::new(registry.clone(), initial, HeartbeatConfig::default());
        let watcher = RegistryWatcher::new(state.clone(), REFRESH_INTERVAL);

        let (tx, mut rx) = mpsc::channel(8);
        state.register_client(None, tx);

        assert_eq!(watcher.poll().await, 0);

        registry
            .transition("node1", Some(55), ComponentState::Stopped)
            .unwrap();
        assert_eq!(watcher.poll().await, 1);
        assert_eq!(watcher.poll().await, 0);

        let frame = rx.recv().await.unwrap();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], "node1");
        assert_eq!(json["component_state"], "Stopped");
        assert!(rx.try_recv().is_err());
    }
}
