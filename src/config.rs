//! Local settings persistence
//!
//! Settings are stored as JSON in the platform config directory:
//! - Linux: ~/.config/lobbylink/settings.json
//! - Windows: %APPDATA%\lobbylink\settings.json
//! - macOS: ~/Library/Application Support/lobbylink/settings.json

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lobby::{ActivityModifiers, ControllerConfig, DEFAULT_MAX_SLOTS, MIN_SLOTS};
use crate::transport::Visibility;

/// Application name used for the configuration directory
const APP_NAME: &str = "lobbylink";

const SETTINGS_FILE: &str = "settings.json";

/// Settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// User settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Settings {
    /// Create a session as soon as the program starts
    #[serde(default)]
    pub auto_start_lobby: bool,

    /// List created sessions publicly (friends-only otherwise)
    #[serde(default = "default_true")]
    pub is_public: bool,

    /// Upper bound for the session slot count. Valid range: 2..=5
    #[serde(default = "default_max_lobby_size")]
    pub max_lobby_size: usize,

    /// Enable the no-fail modifier by default
    #[serde(default = "default_true")]
    pub no_fail_mode: bool,

    /// Verbose logging
    #[serde(default)]
    pub debug_mode: bool,

    /// Show member avatars in the session view
    #[serde(default = "default_true")]
    pub avatars_in_lobby: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_lobby_size() -> usize {
    DEFAULT_MAX_SLOTS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_start_lobby: false,
            is_public: true,
            max_lobby_size: DEFAULT_MAX_SLOTS,
            no_fail_mode: true,
            debug_mode: false,
            avatars_in_lobby: true,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(MIN_SLOTS..=DEFAULT_MAX_SLOTS).contains(&self.max_lobby_size) {
            return Err(SettingsError::Invalid(format!(
                "MaxLobbySize {} must be between {} and {}",
                self.max_lobby_size, MIN_SLOTS, DEFAULT_MAX_SLOTS
            )));
        }
        Ok(())
    }

    /// Session parameters derived from these settings
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            visibility: if self.is_public {
                Visibility::Public
            } else {
                Visibility::FriendsOnly
            },
            max_slots: self.max_lobby_size,
            default_modifiers: ActivityModifiers {
                no_fail: self.no_fail_mode,
                ..ActivityModifiers::default()
            },
        }
    }
}

/// Get the default settings file path
///
/// Returns None if the configuration directory cannot be determined.
pub fn default_settings_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
}

/// Settings bound to a file, written through on every change
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
    dirty: bool,
}

impl SettingsStore {
    /// Load settings from `path`. Missing, unreadable or invalid files are
    /// replaced with defaults, which are written back.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match read_settings(&path) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", path);
                Self {
                    path,
                    settings,
                    dirty: false,
                }
            }
            Err(e) => {
                if path.exists() {
                    warn!("Replacing unusable settings at {:?}: {}", path, e);
                } else {
                    info!("Creating default settings at {:?}", path);
                }
                let mut store = Self {
                    path,
                    settings: Settings::default(),
                    dirty: true,
                };
                if let Err(e) = store.save() {
                    warn!("Failed to write default settings: {}", e);
                }
                store
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the settings if they changed. Returns whether a write happened.
    pub fn save(&mut self) -> Result<bool, SettingsError> {
        if !self.dirty {
            return Ok(false);
        }
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        let content = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.path, content)?;
        self.dirty = false;
        Ok(true)
    }

    /// Apply `change`, then save if anything differs
    pub fn update(&mut self, change: impl FnOnce(&mut Settings)) -> Result<(), SettingsError> {
        let mut next = self.settings.clone();
        change(&mut next);
        next.validate()?;
        if next != self.settings {
            self.settings = next;
            self.dirty = true;
            self.save()?;
        }
        Ok(())
    }

    pub fn set_auto_start_lobby(&mut self, value: bool) -> Result<(), SettingsError> {
        self.update(|s| s.auto_start_lobby = value)
    }

    pub fn set_is_public(&mut self, value: bool) -> Result<(), SettingsError> {
        self.update(|s| s.is_public = value)
    }

    pub fn set_max_lobby_size(&mut self, value: usize) -> Result<(), SettingsError> {
        self.update(|s| s.max_lobby_size = value)
    }

    pub fn set_no_fail_mode(&mut self, value: bool) -> Result<(), SettingsError> {
        self.update(|s| s.no_fail_mode = value)
    }

    pub fn set_debug_mode(&mut self, value: bool) -> Result<(), SettingsError> {
        self.update(|s| s.debug_mode = value)
    }

    pub fn set_avatars_in_lobby(&mut self, value: bool) -> Result<(), SettingsError> {
        self.update(|s| s.avatars_in_lobby = value)
    }

    /// Set a field by its file name (e.g. `MaxLobbySize`)
    pub fn set_by_name(&mut self, name: &str, value: &str) -> Result<(), SettingsError> {
        let flag = || {
            value
                .parse::<bool>()
                .map_err(|_| SettingsError::Invalid(format!("{} expects true or false", name)))
        };
        match name {
            "AutoStartLobby" => self.set_auto_start_lobby(flag()?),
            "IsPublic" => self.set_is_public(flag()?),
            "NoFailMode" => self.set_no_fail_mode(flag()?),
            "DebugMode" => self.set_debug_mode(flag()?),
            "AvatarsInLobby" => self.set_avatars_in_lobby(flag()?),
            "MaxLobbySize" => {
                let size = value.parse::<usize>().map_err(|_| {
                    SettingsError::Invalid(format!("MaxLobbySize expects a number, got {}", value))
                })?;
                self.set_max_lobby_size(size)
            }
            other => Err(SettingsError::Invalid(format!("Unknown setting {}", other))),
        }
    }
}

fn read_settings(path: &Path) -> Result<Settings, SettingsError> {
    let content = fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(!settings.auto_start_lobby);
        assert!(settings.is_public);
        assert_eq!(settings.max_lobby_size, 5);
        assert!(settings.no_fail_mode);
        assert!(!settings.debug_mode);
        assert!(settings.avatars_in_lobby);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_pascal_case_fields() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["MaxLobbySize"], 5);
        assert_eq!(json["IsPublic"], true);

        let partial: Settings = serde_json::from_str(r#"{"DebugMode": true}"#).unwrap();
        assert!(partial.debug_mode);
        assert_eq!(partial.max_lobby_size, 5);
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::load_or_create(&path);
        assert_eq!(store.settings(), &Settings::default());
        assert!(!store.is_dirty());
        assert!(path.exists());
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"MaxLobbySize": 12}"#).unwrap();

        let store = SettingsStore::load_or_create(&path);
        assert_eq!(store.settings().max_lobby_size, 5);
        let on_disk: Settings = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, Settings::default());
    }

    #[test]
    fn test_setters_write_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let mut store = SettingsStore::load_or_create(&path);

        store.set_max_lobby_size(3).unwrap();
        store.set_by_name("IsPublic", "false").unwrap();
        assert!(!store.is_dirty());

        let reloaded = SettingsStore::load_or_create(&path);
        assert_eq!(reloaded.settings().max_lobby_size, 3);
        assert!(!reloaded.settings().is_public);
    }

    #[test]
    fn test_rejected_values_leave_settings_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut store = SettingsStore::load_or_create(dir.path().join("settings.json"));

        assert!(matches!(store.set_max_lobby_size(1), Err(SettingsError::Invalid(_))));
        assert!(matches!(store.set_by_name("IsPublic", "maybe"), Err(SettingsError::Invalid(_))));
        assert!(matches!(store.set_by_name("Volume", "3"), Err(SettingsError::Invalid(_))));
        assert_eq!(store.settings(), &Settings::default());
        assert_eq!(store.save().unwrap(), false);
    }

    #[test]
    fn test_controller_config_mapping() {
        let settings = Settings {
            is_public: false,
            max_lobby_size: 4,
            no_fail_mode: false,
            ..Settings::default()
        };
        let config = settings.controller_config();
        assert_eq!(config.visibility, Visibility::FriendsOnly);
        assert_eq!(config.max_slots, 4);
        assert!(!config.default_modifiers.no_fail);
    }
}
