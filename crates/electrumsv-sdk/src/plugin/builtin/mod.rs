//! Components shipped with the SDK
//!
//! `node` and `status_monitor` are native; the rest are manifests embedded at build
//! time. A `built_in_components/<name>/plugin.toml` next to the binary replaces the
//! compiled-in definition.

pub mod node;
pub mod status_monitor;

use std::path::Path;

use super::{MANIFEST_FILENAME, Manifest, ManifestPlugin, Plugin, SourceTier};
use crate::error::PluginLoadError;

pub use node::NodePlugin;
pub use status_monitor::StatusMonitorPlugin;

macro_rules! embedded {
    ($($name:literal),* $(,)?) => {
        &[$(($name, include_str!(concat!("../../../builtin_components/", $name, "/plugin.toml")))),*]
    };
}

/// Compiled-in plugins with native code
pub const NATIVE: [&str; 2] = ["node", "status_monitor"];

/// `(name, plugin.toml)` for the manifest-defined catalogue
pub const EMBEDDED: &[(&str, &str)] = embedded![
    "dpp_proxy",
    "electrumsv",
    "electrumsv_server",
    "electrumx",
    "header_sv",
    "merchant_api",
    "peer_channels",
    "reference_server",
    "simple_indexer",
    "whatsonchain",
];

/// Every builtin component name
pub fn names() -> impl Iterator<Item = &'static str> {
    NATIVE
        .into_iter()
        .chain(EMBEDDED.iter().map(|(name, _)| *name))
}

pub fn is_builtin(name: &str) -> bool {
    names().any(|n| n == name)
}

/// Instantiate a builtin, honouring an on-disk override
pub fn load(name: &str, override_dir: Option<&Path>) -> Result<Box<dyn Plugin>, PluginLoadError> {
    if let Some(dir) = override_dir {
        if dir.join(MANIFEST_FILENAME).is_file() {
            return Ok(Box::new(ManifestPlugin::from_dir(name, SourceTier::Builtin, dir)?));
        }
    }
    match name {
        "node" => Ok(Box::new(NodePlugin::new())),
        "status_monitor" => Ok(Box::new(StatusMonitorPlugin::new())),
        _ => {
            let (_, text) = EMBEDDED
                .iter()
                .find(|(n, _)| *n == name)
                .ok_or_else(|| PluginLoadError::UnknownPlugin(name.to_string()))?;
            let path = Path::new("builtin").join(name).join(MANIFEST_FILENAME);
            let manifest = Manifest::parse(text, &path)?;
            Ok(Box::new(ManifestPlugin::new(name, SourceTier::Builtin, manifest, None)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_every_builtin_loads() {
        for name in names() {
            let plugin = load(name, None).unwrap();
            let desc = plugin.descriptor();
            assert_eq!(desc.name, name);
            assert_eq!(desc.source_tier, SourceTier::Builtin);
            if let Some(port) = desc.default_port {
                assert!(desc.reserved_ports.contains(&port), "{name} must reserve {port}");
            }
        }
    }

    #[test]
    fn test_reserved_ports_are_unique() {
        let mut seen = BTreeSet::new();
        let mut total = 0;
        for name in names() {
            let plugin = load(name, None).unwrap();
            for port in &plugin.descriptor().reserved_ports {
                seen.insert(*port);
                total += 1;
            }
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn test_on_disk_override() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("electrumx");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILENAME), "default_port = 51111\nreserved_ports = [51111]\n")
            .unwrap();
        let plugin = load("electrumx", Some(&dir)).unwrap();
        assert_eq!(plugin.descriptor().default_port, Some(51111));
        assert_eq!(plugin.descriptor().location.as_deref(), Some(dir.as_path()));

        // a directory without a manifest falls back to the compiled-in definition
        let empty = temp.path().join("node");
        std::fs::create_dir_all(&empty).unwrap();
        let plugin = load("node", Some(&empty)).unwrap();
        assert_eq!(plugin.descriptor().default_port, Some(18332));
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(matches!(load("nope", None), Err(PluginLoadError::UnknownPlugin(_))));
    }
}
