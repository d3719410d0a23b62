use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::job::AnalysisKind;

const SERVER_URL_ENV: &str = "CASESCOPE_SERVER_URL";
const API_TOKEN_ENV: &str = "CASESCOPE_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_url: String,
    pub api_token: Option<String>,
    pub poll_interval_ms: u64,
    pub max_poll_failures: u32,
    pub min_loading_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_upload_bytes: u64,
    pub default_kind: AnalysisKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000/api".to_string(),
            api_token: None,
            poll_interval_ms: 1000,
            max_poll_failures: 3,
            min_loading_ms: 800,
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
            max_upload_bytes: 50 * 1024 * 1024,
            default_kind: AnalysisKind::Auto,
        }
    }
}

impl Settings {
    /// Reads the settings file if present and applies environment overrides.
    /// Problems are logged and fall back to defaults.
    pub fn load() -> Self {
        let mut settings = match settings_file_path() {
            Some(path) if path.exists() => Self::from_file(&path).unwrap_or_else(|err| {
                log::warn!("Ignoring settings file: {err:#}");
                Self::default()
            }),
            _ => Self::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok());
        settings
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Could not parse {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Stores `kind` as the preselected analysis kind in the file at `path`,
    /// keeping every other value the file already has. Environment and launch
    /// overrides never reach the file.
    pub fn save_default_kind(path: &Path, kind: AnalysisKind) -> Result<()> {
        let mut stored = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        stored.default_kind = kind;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Could not create settings directory {}", parent.display())
            })?;
        }
        fs::write(path, stored.to_toml()?)
            .with_context(|| format!("Could not write settings file {}", path.display()))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(SERVER_URL_ENV).filter(|value| !value.trim().is_empty()) {
            self.server_url = url.trim().to_string();
        }
        if let Some(token) = lookup(API_TOKEN_ENV).filter(|value| !value.trim().is_empty()) {
            self.api_token = Some(token.trim().to_string());
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    pub fn min_loading(&self) -> Duration {
        Duration::from_millis(self.min_loading_ms)
    }
}

pub fn settings_file_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        return env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|base| base.join("casescope").join("settings.toml"));
    }

    #[cfg(target_os = "macos")]
    {
        return env::var_os("HOME").map(PathBuf::from).map(|home| {
            home.join("Library")
                .join("Application Support")
                .join("casescope")
                .join("settings.toml")
        });
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("casescope").join("settings.toml"));
        }
        env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".config").join("casescope").join("settings.toml"))
    }
}
