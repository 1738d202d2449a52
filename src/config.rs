// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Loader configuration.
//!
//! Stored as JSON in `~/.resloader/config.json`. Every field has a default,
//! so a partial file (or none at all) is valid.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::LoaderError;

/// Default disk cache budget (10 MiB).
pub const DEFAULT_DISK_CACHE_BYTES: u64 = 10 * 1024 * 1024;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Disk cache directory. Defaults to the platform cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Bumping this discards everything in the disk cache.
    #[serde(default = "default_app_version")]
    pub app_version: u32,
    #[serde(default = "default_true")]
    pub disk_cache_enabled: bool,
    #[serde(default = "default_disk_cache_bytes")]
    pub disk_cache_bytes: u64,
    #[serde(default = "default_disk_concurrency")]
    pub disk_concurrency: usize,
    /// Waiting-set bound for the disk stage queue.
    #[serde(default = "default_capacity")]
    pub disk_capacity: usize,
    #[serde(default = "default_net_concurrency")]
    pub net_concurrency: usize,
    /// Waiting-set bound for the network stage queue.
    #[serde(default = "default_capacity")]
    pub net_capacity: usize,
    #[serde(default = "default_memory_cache_bytes")]
    pub memory_cache_bytes: usize,
    /// Budget for resources evicted from memory while still in use.
    #[serde(default = "default_recycler_bytes")]
    pub recycler_bytes: usize,
    /// Per-stage timeout. Unset means no timeout.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    /// Let concurrent loads of the same key share one pipeline instead of
    /// canceling the newcomer.
    #[serde(default)]
    pub duplicate_load: bool,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_true() -> bool {
    true
}

fn default_app_version() -> u32 {
    1
}

fn default_disk_cache_bytes() -> u64 {
    DEFAULT_DISK_CACHE_BYTES
}

fn default_disk_concurrency() -> usize {
    5
}

fn default_net_concurrency() -> usize {
    3
}

fn default_capacity() -> usize {
    10
}

fn default_memory_cache_bytes() -> usize {
    crate::cache::DEFAULT_MEMORY_BYTES
}

fn default_recycler_bytes() -> usize {
    crate::cache::DEFAULT_RECYCLER_BYTES
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    format!("resloader/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            app_version: default_app_version(),
            disk_cache_enabled: true,
            disk_cache_bytes: default_disk_cache_bytes(),
            disk_concurrency: default_disk_concurrency(),
            disk_capacity: default_capacity(),
            net_concurrency: default_net_concurrency(),
            net_capacity: default_capacity(),
            memory_cache_bytes: default_memory_cache_bytes(),
            recycler_bytes: default_recycler_bytes(),
            task_timeout_secs: None,
            duplicate_load: false,
            http_timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl LoaderConfig {
    /// Reject values the loader cannot run with.
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.disk_concurrency == 0 {
            return Err(LoaderError::Config("disk_concurrency must be at least 1".into()));
        }
        if self.net_concurrency == 0 {
            return Err(LoaderError::Config("net_concurrency must be at least 1".into()));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(LoaderError::Config("task_timeout_secs must be positive when set".into()));
        }
        Ok(())
    }

    /// Cache directory, falling back to the platform cache dir.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .map(|dir| dir.join("resloader"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".resloader").join("cache")))
            .unwrap_or_else(|| PathBuf::from(".resloader/cache"))
    }
}

/// Directory holding `config.json`.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".resloader"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load a config file, or defaults if it does not exist.
pub fn load_config(path: &Path) -> Result<LoaderConfig> {
    let config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?
    } else {
        LoaderConfig::default()
    };
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &LoaderConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))?;
    Ok(())
}
