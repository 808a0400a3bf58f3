//! Plugin discovery across the three tiers
//!
//! Discovery only lists directories; plugins are instantiated on demand so a broken
//! manifest only fails the verbs that touch it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use clap::Command;
use tracing::{debug, warn};

use sdk_core::SdkPaths;

use super::{MANIFEST_FILENAME, ManifestPlugin, Plugin, PluginSource, builtin};
use crate::cli::{GrammarSource, Namespace};
use crate::error::PluginLoadError;

/// Directory entries that never name a component type
const IGNORED: [&str; 4] = ["__init__.py", "__pycache__", ".idea", ".vscode"];

/// Resolved component catalogue
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    sources: BTreeMap<String, PluginSource>,
}

impl PluginRegistry {
    /// Scan builtin, user and local tiers; later tiers shadow earlier ones
    pub fn discover(paths: &SdkPaths) -> Self {
        let mut sources = BTreeMap::new();
        for name in builtin::names() {
            let override_dir = paths.builtin_components.join(name);
            let dir = override_dir
                .join(MANIFEST_FILENAME)
                .is_file()
                .then_some(override_dir);
            sources.insert(name.to_string(), PluginSource::Builtin(dir));
        }
        // on-disk builtins that are not compiled in
        for (name, dir) in scan_dir(&paths.builtin_components) {
            sources
                .entry(name)
                .or_insert(PluginSource::Builtin(Some(dir)));
        }
        for (name, dir) in scan_dir(&paths.user_plugins) {
            shadow(&mut sources, name, PluginSource::User(dir));
        }
        for (name, dir) in scan_dir(&paths.local_plugins) {
            shadow(&mut sources, name, PluginSource::Local(dir));
        }
        debug!(count = sources.len(), "Discovered component types");
        Self { sources }
    }

    /// Registry over an explicit source map
    pub fn from_sources(sources: BTreeMap<String, PluginSource>) -> Self {
        Self { sources }
    }

    /// Sorted component type names
    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn source(&self, name: &str) -> Option<&PluginSource> {
        self.sources.get(name)
    }

    pub fn load(&self, name: &str) -> Result<Box<dyn Plugin>, PluginLoadError> {
        match self.sources.get(name) {
            None => Err(PluginLoadError::UnknownPlugin(name.to_string())),
            Some(PluginSource::Builtin(dir)) if builtin::is_builtin(name) => {
                builtin::load(name, dir.as_deref())
            }
            Some(source) => {
                let dir = source
                    .dir()
                    .ok_or_else(|| PluginLoadError::UnknownPlugin(name.to_string()))?;
                Ok(Box::new(ManifestPlugin::from_dir(name, source.tier(), dir)?))
            }
        }
    }

    /// Union of every plugin's reserved ports; unloadable plugins are skipped
    pub fn reserved_ports(&self) -> BTreeSet<u16> {
        let mut ports = BTreeSet::new();
        for name in self.sources.keys() {
            match self.load(name) {
                Ok(plugin) => ports.extend(plugin.descriptor().reserved_ports.iter().copied()),
                Err(e) => warn!("Skipping reserved ports of '{}': {}", name, e),
            }
        }
        ports
    }

    /// Reserved ports, failing when two plugins claim the same one
    pub fn check_reserved_ports(&self) -> Result<BTreeSet<u16>, PluginLoadError> {
        let mut owners: BTreeMap<u16, String> = BTreeMap::new();
        for name in self.sources.keys() {
            let plugin = match self.load(name) {
                Ok(plugin) => plugin,
                Err(e) => {
                    warn!("Skipping reserved ports of '{}': {}", name, e);
                    continue;
                }
            };
            for port in &plugin.descriptor().reserved_ports {
                if let Some(first) = owners.insert(*port, name.clone()) {
                    return Err(PluginLoadError::ReservedPortConflict {
                        port: *port,
                        first,
                        second: name.clone(),
                    });
                }
            }
        }
        Ok(owners.into_keys().collect())
    }
}

impl GrammarSource for PluginRegistry {
    fn component_names(&self) -> Vec<String> {
        self.names()
    }

    fn is_known(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    fn extend_cli(
        &self,
        component: &str,
        namespace: Namespace,
        cmd: Command,
    ) -> Result<(Command, Vec<String>), PluginLoadError> {
        let plugin = self.load(component)?;
        Ok(match namespace {
            Namespace::Start => plugin.extend_start_cli(cmd),
            Namespace::Reset => plugin.extend_reset_cli(cmd),
            _ => (cmd, Vec::new()),
        })
    }
}

fn shadow(sources: &mut BTreeMap<String, PluginSource>, name: String, source: PluginSource) {
    if let Some(previous) = sources.get(&name) {
        debug!("Plugin '{}' from {} shadows {}", name, source.tier(), previous.tier());
    }
    sources.insert(name, source);
}

/// Candidate plugin directories under `root`, sorted by name
fn scan_dir(root: &Path) -> Vec<(String, std::path::PathBuf)> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || IGNORED.contains(&name.as_str()) {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if !path.join(MANIFEST_FILENAME).is_file() {
            // still listed, so naming it fails with MissingPlugin instead of UnknownComponent
            warn!("Plugin directory without {}: {}", MANIFEST_FILENAME, path.display());
        }
        found.push((name, path));
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::SourceTier;
    use tempfile::TempDir;

    fn paths(temp: &TempDir) -> SdkPaths {
        let home = temp.path().join("home");
        let cwd = temp.path().join("project");
        let exe = temp.path().join("bin");
        SdkPaths::at(home, &cwd, &exe)
    }

    fn write_plugin(dir: &Path, manifest: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILENAME), manifest).unwrap();
    }

    #[test]
    fn test_builtins_only() {
        let temp = TempDir::new().unwrap();
        let registry = PluginRegistry::discover(&paths(&temp));
        let names = registry.names();
        assert!(names.contains(&"node".to_string()));
        assert!(names.contains(&"electrumx".to_string()));
        assert_eq!(names.len(), 12);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_precedence_local_over_user_over_builtin() {
        let temp = TempDir::new().unwrap();
        let paths = paths(&temp);
        write_plugin(&paths.user_plugins.join("electrumx"), "default_port = 51101\nreserved_ports = [51101]\n");
        write_plugin(&paths.user_plugins.join("my_indexer"), "default_port = 7000\n");
        write_plugin(&paths.local_plugins.join("my_indexer"), "default_port = 7100\n");

        let registry = PluginRegistry::discover(&paths);
        assert_eq!(registry.source("electrumx").unwrap().tier(), SourceTier::User);
        assert_eq!(registry.source("my_indexer").unwrap().tier(), SourceTier::Local);
        assert_eq!(registry.source("node").unwrap().tier(), SourceTier::Builtin);

        let plugin = registry.load("my_indexer").unwrap();
        assert_eq!(plugin.descriptor().default_port, Some(7100));
        let plugin = registry.load("electrumx").unwrap();
        assert_eq!(plugin.descriptor().default_port, Some(51101));
    }

    #[test]
    fn test_ignored_entries() {
        let temp = TempDir::new().unwrap();
        let paths = paths(&temp);
        for name in ["__pycache__", ".idea", ".hidden"] {
            std::fs::create_dir_all(paths.local_plugins.join(name)).unwrap();
        }
        write_plugin(&paths.local_plugins.join("__pycache__"), "");
        std::fs::write(paths.local_plugins.join("__init__.py"), "").unwrap();
        std::fs::write(paths.local_plugins.join("notes.txt"), "").unwrap();

        let registry = PluginRegistry::discover(&paths);
        for name in ["__pycache__", ".idea", ".hidden", "__init__.py", "notes.txt"] {
            assert!(registry.source(name).is_none(), "{name} should be ignored");
        }
    }

    #[test]
    fn test_directory_without_manifest_fails_on_load() {
        let temp = TempDir::new().unwrap();
        let paths = paths(&temp);
        std::fs::create_dir_all(paths.user_plugins.join("half_done")).unwrap();

        let registry = PluginRegistry::discover(&paths);
        assert!(registry.is_known("half_done"));
        match registry.load("half_done") {
            Err(PluginLoadError::MissingPlugin { name, path }) => {
                assert_eq!(name, "half_done");
                assert_eq!(path, paths.user_plugins.join("half_done").join(MANIFEST_FILENAME));
            }
            other => panic!("expected MissingPlugin, got {:?}", other.map(|_| ())),
        }
        // broken entries do not hide the ports of the others
        assert!(registry.check_reserved_ports().unwrap().contains(&18332));
    }

    #[test]
    fn test_builtin_override_on_disk() {
        let temp = TempDir::new().unwrap();
        let paths = paths(&temp);
        write_plugin(&paths.builtin_components.join("header_sv"), "default_port = 33555\nreserved_ports = [33555]\n");
        let registry = PluginRegistry::discover(&paths);
        assert_eq!(
            registry.source("header_sv"),
            Some(&PluginSource::Builtin(Some(paths.builtin_components.join("header_sv"))))
        );
        assert_eq!(registry.load("header_sv").unwrap().descriptor().default_port, Some(33555));
    }

    #[test]
    fn test_reserved_port_union_and_conflict() {
        let temp = TempDir::new().unwrap();
        let paths = paths(&temp);
        let registry = PluginRegistry::discover(&paths);
        let ports = registry.check_reserved_ports().unwrap();
        assert!(ports.contains(&18332));
        assert!(ports.contains(&56565));
        assert_eq!(ports, registry.reserved_ports());

        write_plugin(&paths.local_plugins.join("clash"), "default_port = 9999\nreserved_ports = [9999]\n");
        let registry = PluginRegistry::discover(&paths);
        match registry.check_reserved_ports() {
            Err(PluginLoadError::ReservedPortConflict { port, first, second }) => {
                assert_eq!(port, 9999);
                assert_eq!(first, "clash");
                assert_eq!(second, "electrumsv");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_manifest_fails_on_load_only() {
        let temp = TempDir::new().unwrap();
        let paths = paths(&temp);
        write_plugin(&paths.local_plugins.join("broken"), "default_port = \"nope\"");
        let registry = PluginRegistry::discover(&paths);
        assert!(registry.is_known("broken"));
        assert!(matches!(
            registry.load("broken"),
            Err(PluginLoadError::InvalidManifest { .. })
        ));
        assert!(matches!(registry.load("ghost"), Err(PluginLoadError::UnknownPlugin(_))));
    }

    #[test]
    fn test_grammar_extension_by_namespace() {
        let temp = TempDir::new().unwrap();
        let registry = PluginRegistry::discover(&paths(&temp));
        let (_, ids) = registry
            .extend_cli("node", Namespace::Start, Command::new("start"))
            .unwrap();
        assert_eq!(ids, vec!["regtest".to_string(), "testnet".to_string()]);
        let (_, ids) = registry
            .extend_cli("node", Namespace::Stop, Command::new("stop"))
            .unwrap();
        assert!(ids.is_empty());
        let (_, ids) = registry
            .extend_cli("electrumsv", Namespace::Reset, Command::new("reset"))
            .unwrap();
        assert_eq!(ids, vec!["deterministic_seed".to_string()]);
    }
}
