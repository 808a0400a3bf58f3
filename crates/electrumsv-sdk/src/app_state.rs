//! Engine state shared by the controller and plugins

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use sdk_core::{Registry, SdkConfig, SdkPaths};

use crate::error::SdkResult;
use crate::plugin::PluginRegistry;
use crate::supervisor::Launcher;
use crate::util::{NetstatProbe, PortProbe};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    paths: SdkPaths,

    /// `config.json` of the active home, as loaded at startup
    config: SdkConfig,

    registry: Registry,

    plugins: PluginRegistry,

    launcher: Launcher,

    probe: Arc<dyn PortProbe>,

    /// Union of reserved ports, computed on first use
    reserved_ports: OnceLock<BTreeSet<u16>>,

    #[cfg(test)]
    _home: Option<tempfile::TempDir>,
}

impl AppState {
    pub fn new(
        paths: SdkPaths,
        config: SdkConfig,
        plugins: PluginRegistry,
        launcher: Launcher,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        let registry = Registry::from_paths(&paths);
        Self {
            inner: Arc::new(AppStateInner {
                paths,
                config,
                registry,
                plugins,
                launcher,
                probe,
                reserved_ports: OnceLock::new(),
                #[cfg(test)]
                _home: None,
            }),
        }
    }

    /// Resolve the SDK home, create its directories and discover plugins
    pub fn bootstrap() -> SdkResult<Self> {
        let paths = SdkPaths::resolve()?;
        paths.ensure_dirs()?;
        let config = SdkConfig::load_file(&paths.config_file)?;
        let plugins = PluginRegistry::discover(&paths);
        let launcher = Launcher::locate();

        info!(home = %paths.home.display(), "SDK home");
        debug!(
            runner = %launcher.runner().display(),
            plugins = plugins.names().len(),
            "Engine ready"
        );
        Ok(Self::new(paths, config, plugins, launcher, Arc::new(NetstatProbe)))
    }

    pub fn paths(&self) -> &SdkPaths {
        &self.inner.paths
    }

    pub fn config(&self) -> &SdkConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.inner.plugins
    }

    pub fn launcher(&self) -> &Launcher {
        &self.inner.launcher
    }

    pub fn probe(&self) -> &dyn PortProbe {
        self.inner.probe.as_ref()
    }

    /// Ports that only default ids may bind
    pub fn reserved_ports(&self) -> BTreeSet<u16> {
        self.inner
            .reserved_ports
            .get_or_init(|| self.inner.plugins.reserved_ports())
            .clone()
    }
}

#[cfg(test)]
impl AppState {
    /// State rooted in a fresh temporary home with builtin plugins only
    pub(crate) fn for_tests(probe: impl PortProbe + 'static) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let paths = SdkPaths::at(
            temp.path().join("home"),
            &temp.path().join("cwd"),
            &temp.path().join("bin"),
        );
        paths.ensure_dirs().unwrap();
        let plugins = PluginRegistry::discover(&paths);
        let launcher = Launcher::new(crate::supervisor::RUNNER_NAME);

        let registry = Registry::from_paths(&paths);
        Self {
            inner: Arc::new(AppStateInner {
                paths,
                config: SdkConfig::default(),
                registry,
                plugins,
                launcher,
                probe: Arc::new(probe),
                reserved_ports: OnceLock::new(),
                _home: Some(temp),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::port::tests::FakeProbe;

    #[test]
    fn test_reserved_ports_cover_builtins() {
        let app = AppState::for_tests(FakeProbe::default());
        let reserved = app.reserved_ports();
        assert!(reserved.contains(&18332));
        assert!(reserved.contains(&56565));
    }

    #[test]
    fn test_clones_share_the_registry() {
        let app = AppState::for_tests(FakeProbe::default());
        let other = app.clone();
        app.registry()
            .upsert(sdk_core::ComponentRecord::new("node1", "node"))
            .unwrap();
        assert!(other.registry().get_by_id("node1").unwrap().is_some());
        assert!(app.paths().home.is_dir());
    }
}
