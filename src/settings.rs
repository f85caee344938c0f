use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{connection::Location, models::Role};

pub const ENV_SERVER_URL: &str = "ROLLCALL_SERVER_URL";
pub const ENV_ROLE: &str = "ROLLCALL_ROLE";
pub const ENV_TOKEN: &str = "ROLLCALL_TOKEN";
pub const ENV_DATA_DIR: &str = "ROLLCALL_DATA_DIR";
pub const ENV_DEBUG: &str = "ROLLCALL_DEBUG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub server_url: String,
    pub role: Role,
    pub lock_timeout_secs: u64,
    pub tick_interval_ms: u64,
    pub default_duration_minutes: u32,
    pub reconnect_max_backoff_secs: u64,
    pub location: Option<Location>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8000/socket".into(),
            role: Role::Student,
            lock_timeout_secs: 30,
            tick_interval_ms: 1_000,
            default_duration_minutes: 5,
            reconnect_max_backoff_secs: 30,
            location: None,
        }
    }
}

impl Settings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(100))
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_backoff_secs.max(1))
    }

    /// Applies `ROLLCALL_*` overrides on top of the file values.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|url| !url.trim().is_empty()) {
            self.server_url = url;
        }
        if let Some(role) = lookup(ENV_ROLE).and_then(|raw| raw.parse().ok()) {
            self.role = role;
        }
        self
    }
}

/// Token for the duplex channel, if the login flow left one behind.
pub fn auth_token() -> Option<String> {
    env::var(ENV_TOKEN).ok().filter(|token| !token.trim().is_empty())
}

pub fn debug_enabled() -> bool {
    env::var(ENV_DEBUG)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Where the state store and settings file live.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var(ENV_DATA_DIR) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|dir| dir.join("rollcall"))
        .context("no platform data directory; set ROLLCALL_DATA_DIR")
}

/// The settings file in the data directory.
pub struct SettingsStore {
    data: Settings,
}

impl SettingsStore {
    /// Loads `path`, falling back to defaults when it is missing or unreadable
    /// as settings. A missing file is written out so it can be edited.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Ignoring malformed settings file {}: {err}", path.display());
                Settings::default()
            })
        } else {
            let defaults = Settings::default();
            persist(&path, &defaults)?;
            defaults
        };

        Ok(Self { data })
    }

    pub fn current(&self) -> Settings {
        self.data.clone()
    }

    /// Effective settings with environment overrides applied.
    pub fn effective(&self) -> Settings {
        self.current().with_env_overrides(|key| env::var(key).ok())
    }
}

fn persist(path: &Path, data: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(data)?;
    fs::write(path, serialized)
        .with_context(|| format!("Failed to write settings to {}", path.display()))
}
