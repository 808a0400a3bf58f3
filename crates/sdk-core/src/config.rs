//! Persisted SDK configuration (`config.json`)
//!
//! Values are layered with figment: built-in defaults, then the JSON file, then the
//! `SDK_HOME_DIR` / `SDK_PORTABLE_MODE` environment variables.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::ConfigResult;

/// Environment variable overriding the SDK home directory
pub const SDK_HOME_DIR_ENV: &str = "SDK_HOME_DIR";

/// Environment variable enabling portable mode
pub const SDK_PORTABLE_MODE_ENV: &str = "SDK_PORTABLE_MODE";

/// Contents of `<SDK_HOME>/config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkConfig {
    /// Set until the first invocation has reset the bundled node
    #[serde(default = "default_first_run")]
    pub is_first_run: bool,

    /// Overrides the platform default home directory
    #[serde(default)]
    pub sdk_home_dir: Option<PathBuf>,

    /// Portable mode (only honoured with the `portable` feature)
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub portable: bool,
}

fn default_first_run() -> bool {
    true
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            is_first_run: true,
            sdk_home_dir: None,
            portable: false,
        }
    }
}

impl SdkConfig {
    /// Load configuration from `path` with environment overrides applied.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config: SdkConfig = Self::figment(path).extract()?;
        debug!(path = %path.display(), ?config, "Loaded SDK config");
        Ok(config)
    }

    /// Load configuration from `path` without consulting the environment
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        let config = Figment::from(Serialized::defaults(SdkConfig::default()))
            .merge(Json::file(path))
            .extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SdkConfig::default()))
            .merge(Json::file(path))
            .merge(
                Env::raw()
                    .only(&[SDK_HOME_DIR_ENV, SDK_PORTABLE_MODE_ENV])
                    .map(|key| {
                        if key.as_str().eq_ignore_ascii_case(SDK_PORTABLE_MODE_ENV) {
                            "portable".into()
                        } else {
                            key.as_str().to_ascii_lowercase().into()
                        }
                    }),
            )
    }

    /// Write the configuration back to disk as pretty JSON
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "Saved SDK config");
        Ok(())
    }
}

/// Accepts `true`/`false`, `0`/`1` and their string forms
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
        Flag::Str(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = SdkConfig::load_file(&temp.path().join("config.json")).unwrap();
        assert_eq!(config, SdkConfig::default());
        assert!(config.is_first_run);
    }

    #[test]
    fn test_round_trip_through_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let config = SdkConfig {
            is_first_run: false,
            sdk_home_dir: Some(temp.path().join("home")),
            portable: false,
        };
        config.save(&path).unwrap();

        let loaded = SdkConfig::load_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"is_first_run": false}"#).unwrap();

        let loaded = SdkConfig::load_file(&path).unwrap();
        assert!(!loaded.is_first_run);
        assert_eq!(loaded.sdk_home_dir, None);
        assert!(!loaded.portable);
    }

    #[test]
    fn test_portable_flag_accepts_numbers() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"portable": 1}"#).unwrap();

        let loaded = SdkConfig::load_file(&path).unwrap();
        assert!(loaded.portable);
    }
}
