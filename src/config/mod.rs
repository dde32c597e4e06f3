//! Settings file - loaded once at startup and passed by value

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::{CapstanError, Result};

const CONFIG_DIR: &str = "capstan";
const SETTINGS_FILE: &str = "capstan.toml";

/// Credential fallback when the settings file carries no key
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// API credential; falls back to the environment when absent
    pub api_key: Option<String>,
    /// Default model name
    pub model: String,
    /// Keep-alive ping cadence; zero disables the timer
    pub keep_alive_minutes: u64,
    /// Include tool definitions in requests
    pub tool_use_enabled: bool,
    /// How long a tool_use waits for its result before expiring
    pub tool_pair_timeout_minutes: u64,
    /// Database file name inside the config directory
    pub database: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            keep_alive_minutes: 4,
            tool_use_enabled: true,
            tool_pair_timeout_minutes: 5,
            database: "capstan.db".to_string(),
        }
    }
}

impl Settings {
    /// Load from the platform config dir; missing or unreadable files fall
    /// back to defaults
    pub fn load() -> Self {
        match Self::settings_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                tracing::warn!("Could not locate settings: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::settings_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CapstanError::Config(format!("Failed to create config dir: {}", e))
                })?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CapstanError::Config(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| CapstanError::Config(format!("Failed to write settings: {}", e)))
    }

    pub fn config_dir() -> Result<PathBuf> {
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join(CONFIG_DIR))
            .ok_or_else(|| {
                CapstanError::Config("Could not determine config directory".to_string())
            })
    }

    pub fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(SETTINGS_FILE))
    }

    /// The credential, from the file or the environment. Missing credentials
    /// are fatal at startup.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(CapstanError::Config(format!(
                "No API key configured; set api_key or {}",
                API_KEY_ENV
            ))),
        }
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_minutes * 60)
    }

    pub fn tool_pair_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_pair_timeout_minutes * 60)
    }

    /// Full path of the persistence database
    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(&self.database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.keep_alive_minutes, 4);
        assert_eq!(settings.tool_pair_timeout_minutes, 5);
        assert!(settings.tool_use_enabled);
        assert_eq!(settings.database, "capstan.db");
        assert_eq!(
            settings.keep_alive_interval(),
            Duration::from_secs(240)
        );
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capstan.toml");

        let mut settings = Settings::default();
        settings.model = "claude-3-5-haiku-20241022".to_string();
        settings.keep_alive_minutes = 9;
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.model, "claude-3-5-haiku-20241022");
        assert_eq!(loaded.keep_alive_minutes, 9);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load_from(&dir.path().join("nope.toml"));
        assert_eq!(loaded.model, Settings::default().model);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capstan.toml");
        std::fs::write(&path, "keep_alive_minutes = 1\n").unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.keep_alive_minutes, 1);
        assert_eq!(loaded.model, Settings::default().model);
    }

    #[test]
    fn test_api_key_from_file_wins() {
        let settings = Settings {
            api_key: Some("sk-file".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.resolve_api_key().unwrap(), "sk-file");
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let settings = Settings {
            api_key: Some(String::new()),
            ..Default::default()
        };
        if std::env::var(API_KEY_ENV).is_ok() {
            // Environment provides a key on this machine; nothing to assert
            return;
        }
        assert!(matches!(
            settings.resolve_api_key(),
            Err(CapstanError::Config(_))
        ));
    }
}
