//! Well-known SDK directories
//!
//! Resolved once at process start. `ensure_dirs` creates every writable directory;
//! nothing here mutates the tree afterwards.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{SDK_HOME_DIR_ENV, SDK_PORTABLE_MODE_ENV, SdkConfig};
use crate::error::{ConfigError, ConfigResult};

/// Directory name of per-user plugins inside the SDK home
pub const USER_PLUGINS_DIRNAME: &str = "user_plugins";

/// Directory name of project-local plugins inside the working directory
pub const LOCAL_PLUGINS_DIRNAME: &str = "electrumsv_sdk_plugins";

/// Directory name of on-disk builtin components next to the executable
pub const BUILTIN_COMPONENTS_DIRNAME: &str = "built_in_components";

/// Registry file name inside the SDK home
pub const REGISTRY_FILENAME: &str = "component_state.json";

/// Anchor file searched for by portable mode
#[cfg(feature = "portable")]
pub const PORTABLE_ANCHOR: &str = "electrumsv-sdk.portable";

/// All directories and files the SDK knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkPaths {
    pub home: PathBuf,
    pub remote_repos: PathBuf,
    pub shell_scripts: PathBuf,
    pub component_datadirs: PathBuf,
    pub logs: PathBuf,
    pub python_libs: PathBuf,
    pub user_plugins: PathBuf,
    pub local_plugins: PathBuf,
    pub builtin_components: PathBuf,
    pub config_file: PathBuf,
    pub registry_file: PathBuf,
}

impl SdkPaths {
    /// Lay out every path under `home` without touching the filesystem
    pub fn at(home: impl Into<PathBuf>, cwd: &Path, exe_dir: &Path) -> Self {
        let home = home.into();
        Self {
            remote_repos: home.join("remote_repos"),
            shell_scripts: home.join("shell_scripts"),
            component_datadirs: home.join("component_datadirs"),
            logs: home.join("logs"),
            python_libs: home.join("python_libs"),
            user_plugins: home.join(USER_PLUGINS_DIRNAME),
            local_plugins: cwd.join(LOCAL_PLUGINS_DIRNAME),
            builtin_components: exe_dir.join(BUILTIN_COMPONENTS_DIRNAME),
            config_file: home.join("config.json"),
            registry_file: home.join(REGISTRY_FILENAME),
            home,
        }
    }

    /// Resolve the SDK home for this process.
    ///
    /// Precedence: `SDK_HOME_DIR`, then `sdk_home_dir` in the default home's
    /// `config.json`, then the platform default.
    pub fn resolve() -> ConfigResult<Self> {
        let default_home = default_home()?;
        let bootstrap = SdkConfig::load(&default_home.join("config.json"))?;

        let home = match portable_home(&bootstrap) {
            Some(home) => home,
            None => bootstrap.sdk_home_dir.clone().unwrap_or(default_home),
        };

        let cwd = std::env::current_dir()?;
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| cwd.clone());

        debug!(home = %home.display(), "Resolved SDK home");
        Ok(Self::at(home, &cwd, &exe_dir))
    }

    /// Create every writable directory
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.home,
            &self.remote_repos,
            &self.shell_scripts,
            &self.component_datadirs,
            &self.logs,
            &self.python_libs,
            &self.user_plugins,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// `<SDK_HOME>/component_datadirs/<component_type>`
    pub fn component_type_datadirs(&self, component_type: &str) -> PathBuf {
        self.component_datadirs.join(component_type)
    }

    /// `<SDK_HOME>/component_datadirs/<component_type>/<id>`
    pub fn component_datadir(&self, component_type: &str, id: &str) -> PathBuf {
        self.component_type_datadirs(component_type).join(id)
    }

    /// `<SDK_HOME>/logs/<component_type>/<id>`
    pub fn component_logs_dir(&self, component_type: &str, id: &str) -> PathBuf {
        self.logs.join(component_type).join(id)
    }

    /// `<SDK_HOME>/remote_repos/<component_type>`
    pub fn remote_repo_dir(&self, component_type: &str) -> PathBuf {
        self.remote_repos.join(component_type)
    }

    /// Lock file guarding the registry
    pub fn registry_lock(&self) -> PathBuf {
        lock_path_for(&self.registry_file)
    }
}

/// `<file>.lock` next to `file`
pub fn lock_path_for(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Platform default SDK home
pub fn default_home() -> ConfigResult<PathBuf> {
    if let Ok(dir) = std::env::var(SDK_HOME_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    if cfg!(windows) {
        dirs::data_local_dir()
            .map(|dir| dir.join("ElectrumSV-SDK"))
            .ok_or(ConfigError::NoHomeDir)
    } else {
        dirs::home_dir()
            .map(|dir| dir.join(".electrumsv-sdk"))
            .ok_or(ConfigError::NoHomeDir)
    }
}

#[cfg(feature = "portable")]
fn portable_home(config: &SdkConfig) -> Option<PathBuf> {
    if !config.portable {
        return None;
    }
    let cwd = std::env::current_dir().ok()?;
    match find_portable_anchor(&cwd) {
        Some(anchor_dir) => Some(anchor_dir.join(".electrumsv-sdk")),
        None => {
            warn!(
                "{} is set but no {} anchor was found above {}",
                SDK_PORTABLE_MODE_ENV,
                PORTABLE_ANCHOR,
                cwd.display()
            );
            None
        }
    }
}

#[cfg(not(feature = "portable"))]
fn portable_home(config: &SdkConfig) -> Option<PathBuf> {
    if config.portable {
        warn!(
            "{} was requested but portable mode is not enabled in this build",
            SDK_PORTABLE_MODE_ENV
        );
    }
    None
}

/// Walk up from `start` looking for the portable anchor file
#[cfg(feature = "portable")]
pub fn find_portable_anchor(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(PORTABLE_ANCHOR).is_file())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_under_home() {
        let paths = SdkPaths::at("/sdk", Path::new("/work"), Path::new("/opt/bin"));

        assert_eq!(paths.registry_file, PathBuf::from("/sdk/component_state.json"));
        assert_eq!(paths.registry_lock(), PathBuf::from("/sdk/component_state.json.lock"));
        assert_eq!(paths.config_file, PathBuf::from("/sdk/config.json"));
        assert_eq!(paths.user_plugins, PathBuf::from("/sdk/user_plugins"));
        assert_eq!(paths.local_plugins, PathBuf::from("/work/electrumsv_sdk_plugins"));
        assert_eq!(
            paths.builtin_components,
            PathBuf::from("/opt/bin/built_in_components")
        );
        assert_eq!(
            paths.component_datadir("node", "node1"),
            PathBuf::from("/sdk/component_datadirs/node/node1")
        );
        assert_eq!(
            paths.component_logs_dir("node", "node2"),
            PathBuf::from("/sdk/logs/node/node2")
        );
    }

    #[test]
    fn test_ensure_dirs_creates_writable_tree() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("sdk");
        let paths = SdkPaths::at(&home, temp.path(), temp.path());

        paths.ensure_dirs().unwrap();
        assert!(paths.remote_repos.is_dir());
        assert!(paths.component_datadirs.is_dir());
        assert!(paths.logs.is_dir());
        assert!(paths.python_libs.is_dir());
        assert!(paths.user_plugins.is_dir());
        // Local plugins are owned by the project, never created
        assert!(!paths.local_plugins.exists());

        // Idempotent
        paths.ensure_dirs().unwrap();
    }

    #[cfg(feature = "portable")]
    #[test]
    fn test_portable_anchor_search() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join(PORTABLE_ANCHOR), "").unwrap();

        assert_eq!(find_portable_anchor(&nested), Some(temp.path().to_path_buf()));
    }
}
