//! Component Registry
//!
//! A JSON document mapping component ids to [`ComponentRecord`]s, shared between the
//! CLI, background supervisors and the status monitor. Every operation takes an
//! advisory lock on `<file>.lock`, reads the whole document, mutates it in memory and
//! writes it back through a temp file + rename.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use fs2::FileExt;
use tracing::{debug, trace, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::paths::{SdkPaths, lock_path_for};
use crate::record::{ComponentRecord, ComponentState};

/// Default time to wait for the registry lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Full registry contents, ordered by id
pub type Snapshot = BTreeMap<String, ComponentRecord>;

/// Handle to the on-disk registry
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

/// Held lock; released on drop
struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release registry lock: {}", e);
        }
    }
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_path: lock_path_for(&path),
            path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn from_paths(paths: &SdkPaths) -> Self {
        Self::new(&paths.registry_file)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> RegistryResult<RegistryLock> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        let contended = fs2::lock_contended_error().raw_os_error();
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    trace!("Acquired registry lock {}", self.lock_path.display());
                    return Ok(RegistryLock { file });
                }
                Err(e) if e.raw_os_error() == contended || e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(RegistryError::LockTimeout {
                            path: self.lock_path.clone(),
                            timeout: self.lock_timeout,
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the document. Missing, truncated or corrupt content reads as empty.
    fn read_unlocked(&self) -> RegistryResult<Snapshot> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Snapshot::new());
        }

        match serde_json::from_str::<Snapshot>(&content) {
            Ok(mut snapshot) => {
                // Keys are authoritative for ids
                for (id, record) in snapshot.iter_mut() {
                    if record.id != *id {
                        record.id = id.clone();
                    }
                }
                Ok(snapshot)
            }
            Err(e) => {
                warn!(
                    "Registry file {} is malformed ({}); treating as empty",
                    self.path.display(),
                    e
                );
                Ok(Snapshot::new())
            }
        }
    }

    fn write_unlocked(&self, snapshot: &Snapshot) -> RegistryResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Run `f` against the document under the lock, writing it back when `f` returns true
    fn with_snapshot<T>(&self, f: impl FnOnce(&mut Snapshot) -> (bool, T)) -> RegistryResult<T> {
        let _lock = self.lock()?;
        let mut snapshot = self.read_unlocked()?;
        let (dirty, result) = f(&mut snapshot);
        if dirty {
            self.write_unlocked(&snapshot)?;
        }
        Ok(result)
    }

    pub fn get_all(&self) -> RegistryResult<Snapshot> {
        let _lock = self.lock()?;
        self.read_unlocked()
    }

    pub fn get_by_id(&self, id: &str) -> RegistryResult<Option<ComponentRecord>> {
        Ok(self.get_all()?.remove(id))
    }

    pub fn get_by_type(&self, component_type: &str) -> RegistryResult<Vec<ComponentRecord>> {
        Ok(self
            .get_all()?
            .into_values()
            .filter(|record| record.component_type == component_type)
            .collect())
    }

    /// Snapshot restricted to a component type or a single id (not both)
    pub fn filter(
        &self,
        component_type: Option<&str>,
        id: Option<&str>,
    ) -> RegistryResult<Snapshot> {
        match (component_type, id) {
            (Some(_), Some(_)) => Err(RegistryError::AmbiguousFilter),
            (Some(component_type), None) => Ok(self
                .get_all()?
                .into_iter()
                .filter(|(_, record)| record.component_type == component_type)
                .collect()),
            (None, Some(id)) => Ok(self
                .get_all()?
                .into_iter()
                .filter(|(key, _)| key == id)
                .collect()),
            (None, None) => self.get_all(),
        }
    }

    /// Insert or replace a record, stamping `last_updated`.
    ///
    /// A running record claims its pid: any other running record holding the same
    /// pid is stale and is marked `Stopped`.
    pub fn upsert(&self, mut record: ComponentRecord) -> RegistryResult<ComponentRecord> {
        self.with_snapshot(|snapshot| {
            if record.is_running() {
                for other in snapshot.values_mut() {
                    if other.id != record.id && other.is_running() && other.pid == record.pid {
                        warn!(
                            component_id = %other.id,
                            pid = ?other.pid,
                            "Pid reused by {}; marking stale record stopped",
                            record.id
                        );
                        other.component_state = ComponentState::Stopped;
                        other.last_updated = next_timestamp(Some(other.last_updated));
                    }
                }
            }

            let previous = snapshot.get(&record.id).map(|r| r.last_updated);
            record.last_updated = next_timestamp(previous);
            debug!(
                component_id = %record.id,
                state = %record.component_state,
                pid = ?record.pid,
                "Registry upsert"
            );
            snapshot.insert(record.id.clone(), record.clone());
            (true, record)
        })
    }

    /// Locked read-modify-write of one record.
    ///
    /// `f` returns whether it changed the record; the new value is written (and
    /// returned) only in that case.
    pub fn update<F>(&self, id: &str, f: F) -> RegistryResult<Option<ComponentRecord>>
    where
        F: FnOnce(&mut ComponentRecord) -> bool,
    {
        self.with_snapshot(|snapshot| {
            let Some(record) = snapshot.get_mut(id) else {
                return (false, None);
            };
            let previous = record.last_updated;
            if !f(record) {
                return (false, None);
            }
            record.id = id.to_string();
            record.last_updated = next_timestamp(Some(previous));
            (true, Some(record.clone()))
        })
    }

    /// Commit a terminal state for the process `pid` of record `id`.
    ///
    /// A no-op when the record has moved on to another pid or is already terminal, so
    /// an exit is committed exactly once no matter who observes it first.
    pub fn transition(
        &self,
        id: &str,
        pid: Option<u32>,
        state: ComponentState,
    ) -> RegistryResult<bool> {
        let updated = self.update(id, |record| {
            if pid.is_some() && record.pid != pid {
                return false;
            }
            if record.component_state.is_terminal() && state.is_terminal() {
                return false;
            }
            if record.component_state == state {
                return false;
            }
            record.component_state = state;
            true
        })?;
        Ok(updated.is_some())
    }

    /// Apply a state change regardless of the current value
    pub fn set_state(&self, id: &str, state: ComponentState) -> RegistryResult<bool> {
        let updated = self.update(id, |record| {
            record.component_state = state;
            true
        })?;
        Ok(updated.is_some())
    }
}

/// `now`, nudged forward so it strictly exceeds `previous`
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::keys;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn registry(temp: &TempDir) -> Registry {
        Registry::new(temp.path().join("component_state.json"))
    }

    #[test]
    fn test_empty_registry() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        assert!(registry.get_all().unwrap().is_empty());
        assert!(registry.get_by_id("node1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_and_lookup() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);

        registry
            .upsert(
                ComponentRecord::new("node1", "node")
                    .with_pid(100)
                    .with_state(ComponentState::Running)
                    .with_metadata(keys::RPCPORT, 18332),
            )
            .unwrap();
        registry
            .upsert(ComponentRecord::new("electrumx1", "electrumx").with_pid(101))
            .unwrap();

        let node = registry.get_by_id("node1").unwrap().unwrap();
        assert_eq!(node.pid, Some(100));
        assert_eq!(node.metadata_u16(keys::RPCPORT), Some(18332));

        let nodes = registry.get_by_type("node").unwrap();
        assert_eq!(nodes.len(), 1);

        let snapshot = registry.get_all().unwrap();
        for (id, record) in &snapshot {
            assert_eq!(id, &record.id);
        }
    }

    #[test]
    fn test_filter_by_type_or_id() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry.upsert(ComponentRecord::new("node1", "node")).unwrap();
        registry.upsert(ComponentRecord::new("node2", "node")).unwrap();
        registry.upsert(ComponentRecord::new("electrumx1", "electrumx")).unwrap();

        assert_eq!(registry.filter(Some("node"), None).unwrap().len(), 2);
        assert_eq!(registry.filter(None, Some("electrumx1")).unwrap().len(), 1);
        assert_eq!(registry.filter(None, None).unwrap().len(), 3);
        assert!(matches!(
            registry.filter(Some("node"), Some("node1")),
            Err(RegistryError::AmbiguousFilter)
        ));
    }

    #[test]
    fn test_corrupt_file_reads_as_empty_and_is_overwritten() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        std::fs::write(registry.path(), "{\"node1\": {\"id\": \"no").unwrap();

        assert!(registry.get_all().unwrap().is_empty());

        registry.upsert(ComponentRecord::new("node1", "node")).unwrap();
        let content = std::fs::read_to_string(registry.path()).unwrap();
        let parsed: Snapshot = serde_json::from_str(&content).unwrap();
        assert!(parsed.contains_key("node1"));
    }

    #[test]
    fn test_last_updated_strictly_increases() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);

        let first = registry.upsert(ComponentRecord::new("node1", "node")).unwrap();
        let mut previous = first.last_updated;
        for state in [
            ComponentState::Running,
            ComponentState::Stopped,
            ComponentState::Running,
        ] {
            let updated = registry.update("node1", |r| {
                r.component_state = state;
                true
            });
            let updated = updated.unwrap().unwrap();
            assert!(updated.last_updated > previous);
            previous = updated.last_updated;
        }
    }

    #[test]
    fn test_transition_commits_once() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry
            .upsert(
                ComponentRecord::new("node1", "node")
                    .with_pid(7)
                    .with_state(ComponentState::Running),
            )
            .unwrap();

        assert!(registry.transition("node1", Some(7), ComponentState::Stopped).unwrap());
        assert!(!registry.transition("node1", Some(7), ComponentState::Failed).unwrap());
        assert_eq!(
            registry.get_by_id("node1").unwrap().unwrap().component_state,
            ComponentState::Stopped
        );
    }

    #[test]
    fn test_transition_ignores_stale_pid() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry
            .upsert(
                ComponentRecord::new("node1", "node")
                    .with_pid(8)
                    .with_state(ComponentState::Running),
            )
            .unwrap();

        assert!(!registry.transition("node1", Some(7), ComponentState::Stopped).unwrap());
        assert!(!registry.transition("missing", None, ComponentState::Stopped).unwrap());
    }

    #[test]
    fn test_running_records_never_share_pid() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry
            .upsert(
                ComponentRecord::new("node1", "node")
                    .with_pid(900)
                    .with_state(ComponentState::Running),
            )
            .unwrap();
        registry
            .upsert(
                ComponentRecord::new("electrumx1", "electrumx")
                    .with_pid(900)
                    .with_state(ComponentState::Running),
            )
            .unwrap();

        let snapshot = registry.get_all().unwrap();
        assert_eq!(snapshot["node1"].component_state, ComponentState::Stopped);
        assert_eq!(snapshot["electrumx1"].component_state, ComponentState::Running);
    }

    #[test]
    fn test_lock_timeout() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp).with_lock_timeout(Duration::from_millis(100));

        let holder = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path_for(registry.path()))
            .unwrap();
        holder.lock_exclusive().unwrap();

        let result = registry.upsert(ComponentRecord::new("node1", "node"));
        assert!(matches!(result, Err(RegistryError::LockTimeout { .. })));

        FileExt::unlock(&holder).unwrap();
        assert!(registry.upsert(ComponentRecord::new("node1", "node")).is_ok());
    }

    #[test]
    fn test_concurrent_upserts_keep_every_id() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(registry(&temp));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for round in 0..5u32 {
                        let record = ComponentRecord::new(format!("worker{}", worker), "worker")
                            .with_pid(round);
                        registry.upsert(record).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.get_all().unwrap();
        assert_eq!(snapshot.len(), 8);
        for record in snapshot.values() {
            assert_eq!(record.pid, Some(4));
        }
    }

    #[test]
    fn test_concurrent_reads_identical() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry.upsert(ComponentRecord::new("node1", "node")).unwrap();

        let a = registry.get_all().unwrap();
        let b = registry.get_all().unwrap();
        assert_eq!(a, b);
    }
}
