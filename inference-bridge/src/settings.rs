//! Persisted bridge settings
//!
//! A small JSON key/value file under the per-user config directory:
//! - Linux: `~/.config/inference-bridge/bridge_settings.json`
//! - macOS: `~/Library/Application Support/inference-bridge/bridge_settings.json`
//! - Windows: `%APPDATA%\inference-bridge\bridge_settings.json`
//!
//! The only key owned here is the last-selected interpreter path.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::SettingsError;

/// Directory name under the platform config directory
pub const APP_CONFIG_DIR: &str = "inference-bridge";

/// Settings file name
pub const SETTINGS_FILE: &str = "bridge_settings.json";

/// Values persisted between sessions
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Interpreter chosen by the user, read again on every start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_path: Option<String>,
}

/// Location of the settings file, with explicit load and save
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store backed by an explicit file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store in the platform's per-user config directory
    pub fn default_location() -> Result<Self, SettingsError> {
        let base = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(Self::at(base.join(APP_CONFIG_DIR).join(SETTINGS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the settings; a missing file yields defaults
    pub fn load(&self) -> Result<BridgeSettings, SettingsError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No settings file, using defaults");
                return Ok(BridgeSettings::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| SettingsError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the settings, creating parent directories as needed
    pub fn save(&self, settings: &BridgeSettings) -> Result<(), SettingsError> {
        let io_err = |source: std::io::Error| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Json {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, text).map_err(io_err)?;
        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("absent.json"));
        assert_eq!(store.load().unwrap(), BridgeSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("nested/dir/settings.json"));

        let settings = BridgeSettings {
            interpreter_path: Some("/opt/envs/vision/bin/python".to_string()),
        };
        store.save(&settings).unwrap();

        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let err = SettingsStore::at(&path).load().unwrap_err();
        assert!(matches!(err, SettingsError::Json { .. }));
    }

    #[test]
    fn test_default_location_is_namespaced() {
        if let Ok(store) = SettingsStore::default_location() {
            assert!(store.path().ends_with("inference-bridge/bridge_settings.json"));
        }
    }
}
