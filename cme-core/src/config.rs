//! Engine configuration
//!
//! Loaded from the `[engine]` and `[reconciler]` tables of a TOML file. Every
//! key except `repo_path` has a default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CmeError, Result};

/// Backend binary used when none is configured.
pub const DEFAULT_BIN_PATH: &str = "/usr/bin/git";

/// Top-level configuration understood by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub reconciler: ReconcilerConfig,
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| CmeError::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| CmeError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.reconciler.validate()
    }
}

/// Storage and backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Storage root; one repository per object type lives beneath it
    pub repo_path: PathBuf,
    /// Version-control binary invoked for every repository operation
    pub bin_path: PathBuf,
    /// Log level for the engine (`trace`..`error`)
    pub log_level: String,
    /// Serve `git-upload-pack` over smart HTTP
    pub upload_pack: bool,
    /// Serve `git-receive-pack` over smart HTTP
    pub receive_pack: bool,
    /// Verify upstream certificates when pulling (pushes always verify)
    pub pull_ssl_verify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::new(),
            bin_path: PathBuf::from(DEFAULT_BIN_PATH),
            log_level: "info".to_string(),
            upload_pack: true,
            receive_pack: true,
            pull_ssl_verify: false,
        }
    }
}

impl EngineConfig {
    /// Config rooted at `repo_path` with every other key defaulted.
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            ..Self::default()
        }
    }

    pub fn with_bin_path(mut self, bin_path: impl Into<PathBuf>) -> Self {
        self.bin_path = bin_path.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo_path.as_os_str().is_empty() {
            return Err(CmeError::Config(
                "required key engine.repo_path not found".to_string(),
            ));
        }
        if self.bin_path.as_os_str().is_empty() {
            return Err(CmeError::Config("engine.bin_path is empty".to_string()));
        }
        Ok(())
    }
}

/// Periods of the background loops, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub device_poll_secs: u64,
    pub clean_secs: u64,
    pub sweep_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            device_poll_secs: 10,
            clean_secs: 10,
            sweep_secs: 60,
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device_poll_secs == 0 || self.clean_secs == 0 || self.sweep_secs == 0 {
            return Err(CmeError::Config(
                "reconciler intervals must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_secs(self.device_poll_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }
}
