//! Deterministic id, datadir and port allocation
//!
//! Default ids (`<component>1`) own the plugin's default port. Every other id gets the
//! first free port in `default + 10, default + 20, ...` that is neither reserved by a
//! plugin nor claimed by another running component.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::debug;

use sdk_core::{SdkPaths, Snapshot};

use crate::error::ResourceError;
use crate::util::PortProbe;

const PORT_STEP: u16 = 10;

/// `<component>1`
pub fn default_component_id(component_type: &str) -> String {
    format!("{component_type}1")
}

pub fn is_default_component_id(component_type: &str, id: &str) -> bool {
    default_component_id(component_type) == id
}

/// Ports held in the metadata of running records (`rpcport`, `p2p_port`, ...)
pub fn claimed_ports(snapshot: &Snapshot, except_id: Option<&str>) -> BTreeSet<u16> {
    snapshot
        .values()
        .filter(|record| record.is_running() && Some(record.id.as_str()) != except_id)
        .flat_map(|record| {
            record
                .metadata
                .keys()
                .filter(|key| key.ends_with("port"))
                .filter_map(|key| record.metadata_u16(key))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Allocator for one start request
pub struct ResourceAllocator<'a> {
    paths: &'a SdkPaths,
    probe: &'a dyn PortProbe,
    reserved_ports: &'a BTreeSet<u16>,
    claimed_ports: BTreeSet<u16>,
}

impl<'a> ResourceAllocator<'a> {
    pub fn new(
        paths: &'a SdkPaths,
        probe: &'a dyn PortProbe,
        reserved_ports: &'a BTreeSet<u16>,
    ) -> Self {
        Self {
            paths,
            probe,
            reserved_ports,
            claimed_ports: BTreeSet::new(),
        }
    }

    pub fn with_claimed_ports(mut self, ports: BTreeSet<u16>) -> Self {
        self.claimed_ports = ports;
        self
    }

    /// Resolve the component id.
    ///
    /// An explicit `--id` wins. `--new` picks the smallest `N >= 1` whose datadir does
    /// not exist yet. Otherwise the default id.
    pub fn allocate_id(&self, component_type: &str, requested: Option<&str>, new: bool) -> String {
        if let Some(id) = requested {
            return id.to_string();
        }
        if !new {
            return default_component_id(component_type);
        }
        let mut n: u32 = 1;
        loop {
            let id = format!("{component_type}{n}");
            if !self.paths.component_datadir(component_type, &id).exists() {
                return id;
            }
            n += 1;
        }
    }

    /// Resolve the id and create its datadir.
    ///
    /// `--new` together with an `--id` whose datadir already exists is refused before
    /// anything is written.
    pub fn allocate_datadir(
        &self,
        component_type: &str,
        requested: Option<&str>,
        new: bool,
    ) -> Result<(String, PathBuf), ResourceError> {
        let id = self.allocate_id(component_type, requested, new);
        let datadir = self.paths.component_datadir(component_type, &id);
        if new && requested.is_some() && datadir.exists() {
            return Err(ResourceError::DatadirExists { id, path: datadir });
        }
        std::fs::create_dir_all(&datadir)?;
        debug!(component_id = %id, datadir = %datadir.display(), "Allocated datadir");
        Ok((id, datadir))
    }

    /// Port for `id` derived from `default_port`.
    ///
    /// The same rule serves secondary ports (p2p, zmq) when called with their own
    /// default.
    pub fn allocate_port(
        &self,
        component_type: &str,
        id: &str,
        default_port: u16,
    ) -> Result<u16, ResourceError> {
        if is_default_component_id(component_type, id) {
            if self.probe.is_in_use(default_port) {
                return Err(ResourceError::PortInUse {
                    port: default_port,
                    id: id.to_string(),
                });
            }
            return Ok(default_port);
        }

        let mut port = default_port
            .checked_add(PORT_STEP)
            .ok_or(ResourceError::NoFreePort(default_port))?;
        while self.reserved_ports.contains(&port)
            || self.claimed_ports.contains(&port)
            || self.probe.is_in_use(port)
        {
            port = port
                .checked_add(PORT_STEP)
                .ok_or(ResourceError::NoFreePort(default_port))?;
        }
        debug!(component_id = %id, port, "Allocated port");
        Ok(port)
    }

    /// Fresh log file path for this run; creates the parent directory
    pub fn log_file(&self, component_type: &str, id: &str) -> Result<PathBuf, ResourceError> {
        let dir = self.paths.component_logs_dir(component_type, id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(log_file_name(Local::now())))
    }
}

/// `<d>_<m>_<y>_<H>_<M>_<S>.log`
pub fn log_file_name(at: DateTime<Local>) -> String {
    at.format("%d_%m_%Y_%H_%M_%S.log").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::port::tests::FakeProbe;
    use chrono::TimeZone;
    use sdk_core::{ComponentRecord, ComponentState};
    use std::path::Path;

    fn paths(temp: &tempfile::TempDir) -> SdkPaths {
        let paths = SdkPaths::at(temp.path().join("home"), temp.path(), temp.path());
        paths.ensure_dirs().unwrap();
        paths
    }

    #[test]
    fn test_default_bring_up() {
        let temp = tempfile::tempdir().unwrap();
        let paths = paths(&temp);
        let probe = FakeProbe::default();
        let reserved = BTreeSet::from([18332, 18444]);
        let alloc = ResourceAllocator::new(&paths, &probe, &reserved);

        let (id, datadir) = alloc.allocate_datadir("node", None, false).unwrap();
        assert_eq!(id, "node1");
        assert!(datadir.ends_with(Path::new("component_datadirs/node/node1")));
        assert!(datadir.is_dir());
        assert_eq!(alloc.allocate_port("node", &id, 18332).unwrap(), 18332);
        assert_eq!(alloc.allocate_port("node", &id, 18444).unwrap(), 18444);
    }

    #[test]
    fn test_default_port_busy_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let paths = paths(&temp);
        let probe = FakeProbe::busy(&[18332]);
        let reserved = BTreeSet::new();
        let alloc = ResourceAllocator::new(&paths, &probe, &reserved);
        let err = alloc.allocate_port("node", "node1", 18332).unwrap_err();
        assert!(matches!(err, ResourceError::PortInUse { port: 18332, .. }));
    }

    #[test]
    fn test_second_instance_autoincrement() {
        let temp = tempfile::tempdir().unwrap();
        let paths = paths(&temp);
        let probe = FakeProbe::busy(&[18332, 18444]);
        let reserved = BTreeSet::from([18332, 18444]);
        let alloc = ResourceAllocator::new(&paths, &probe, &reserved);

        std::fs::create_dir_all(paths.component_datadir("node", "node1")).unwrap();
        let (id, _) = alloc.allocate_datadir("node", None, true).unwrap();
        assert_eq!(id, "node2");
        let rpc = alloc.allocate_port("node", &id, 18332).unwrap();
        let p2p = alloc.allocate_port("node", &id, 18444).unwrap();
        assert!(rpc >= 18342);
        assert!(p2p >= 18454);
        assert_ne!(rpc, p2p);
    }

    #[test]
    fn test_stepping_skips_reserved_claimed_and_busy() {
        let temp = tempfile::tempdir().unwrap();
        let paths = paths(&temp);
        let probe = FakeProbe::busy(&[5010]);
        let reserved = BTreeSet::from([5020]);
        let alloc = ResourceAllocator::new(&paths, &probe, &reserved)
            .with_claimed_ports(BTreeSet::from([5030]));
        assert_eq!(alloc.allocate_port("svc", "svc7", 5000).unwrap(), 5040);
    }

    #[test]
    fn test_new_with_existing_id_is_refused() {
        let temp = tempfile::tempdir().unwrap();
        let paths = paths(&temp);
        let probe = FakeProbe::default();
        let reserved = BTreeSet::new();
        let alloc = ResourceAllocator::new(&paths, &probe, &reserved);

        std::fs::create_dir_all(paths.component_datadir("node", "mynode")).unwrap();
        let err = alloc.allocate_datadir("node", Some("mynode"), true).unwrap_err();
        assert!(matches!(err, ResourceError::DatadirExists { ref id, .. } if id == "mynode"));
        // without --new the existing datadir is reused
        let (id, _) = alloc.allocate_datadir("node", Some("mynode"), false).unwrap();
        assert_eq!(id, "mynode");
    }

    #[test]
    fn test_no_free_port() {
        let temp = tempfile::tempdir().unwrap();
        let paths = paths(&temp);
        let probe = FakeProbe::default();
        let reserved = BTreeSet::new();
        let alloc = ResourceAllocator::new(&paths, &probe, &reserved);
        assert!(matches!(
            alloc.allocate_port("svc", "svc2", 65530),
            Err(ResourceError::NoFreePort(65530))
        ));
    }

    #[test]
    fn test_claimed_ports_from_running_records() {
        let mut snapshot = Snapshot::new();
        let running = ComponentRecord::new("node1", "node")
            .with_pid(10)
            .with_state(ComponentState::Running)
            .with_metadata("rpcport", 18332)
            .with_metadata("p2p_port", "18444")
            .with_metadata("datadir", "/tmp/x");
        let stopped = ComponentRecord::new("node2", "node")
            .with_pid(11)
            .with_state(ComponentState::Stopped)
            .with_metadata("rpcport", 18342);
        snapshot.insert(running.id.clone(), running);
        snapshot.insert(stopped.id.clone(), stopped);

        assert_eq!(claimed_ports(&snapshot, None), BTreeSet::from([18332, 18444]));
        assert!(claimed_ports(&snapshot, Some("node1")).is_empty());
    }

    #[test]
    fn test_log_file_name_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(log_file_name(at), "07_03_2024_09_05_02.log");
    }
}
