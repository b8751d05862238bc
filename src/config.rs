// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent settings in `~/.bgfetch/config.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::BridgeOptions;
use crate::platform::SessionConfiguration;

/// Identifier of the one background session this process owns.
pub const DEFAULT_SESSION_IDENTIFIER: &str = "bgfetch.background";

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_session_identifier")]
    pub session_identifier: String,
    /// Where the transfer session stages raw downloads.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Where downloads without a destination are kept until consumed.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Send managed cookies and reconcile native ones back (default: true)
    #[serde(default = "default_true")]
    pub use_cookies: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Post a notification when background transfers finish (default: true)
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
}

fn default_session_identifier() -> String {
    DEFAULT_SESSION_IDENTIFIER.to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_identifier: default_session_identifier(),
            staging_dir: None,
            temp_dir: None,
            use_cookies: true,
            user_agent: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            notifications_enabled: true,
        }
    }
}

impl Config {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("bgfetch-staging"))
    }

    pub fn session_configuration(&self) -> SessionConfiguration {
        let mut session = SessionConfiguration::background(&self.session_identifier, self.staging_dir());
        session.user_agent = self.user_agent.clone();
        session.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        session.use_native_cookies = self.use_cookies;
        session
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            use_cookies: self.use_cookies,
            temp_dir: self.temp_dir.clone(),
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".bgfetch"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Load from `path`; a missing file means defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &config_path()?)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}
