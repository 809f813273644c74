// SPDX-License-Identifier: MPL-2.0

use crate::config::{APP_ID, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SERVICE_URL};
use crate::ranking::TrendingWindow;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn default_service_url() -> String {
    DEFAULT_SERVICE_URL.to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Base URL of the hosted data service
    #[serde(default = "default_service_url")]
    pub service_url: String,
    /// Public (anon) API key sent with every request
    #[serde(default)]
    pub api_key: String,
    /// Window the trending board opens with
    #[serde(default)]
    pub trending_window: TrendingWindow,
    /// Seconds between realtime polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            api_key: String::new(),
            trending_window: TrendingWindow::default(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl ClientSettings {
    /// ~/.config/io.github.murmur.Murmur/settings.json
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push(APP_ID);
            p.push("settings.json");
            p
        })
    }

    /// Load settings from the default location, or defaults if missing
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load settings from `path`; a missing or unreadable file yields defaults
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring invalid settings file");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        Ok(())
    }
}
