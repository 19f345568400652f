//! Engine configuration
//!
//! Retention limits and scheduling intervals are deployment inputs, stored
//! alongside the data as `revault-config.json`.

use crate::error::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine configuration stored at `<data_dir>/revault-config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for versions, backups, and protection rules
    pub data_dir: PathBuf,
    /// Maximum versions retained per item before the oldest
    /// non-published ones are evicted
    #[serde(default = "default_max_versions")]
    pub max_versions_per_item: usize,
    /// Auto-save tick interval in seconds
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval_secs: u64,
    /// Backups older than this are eligible for cleanup
    #[serde(default = "default_retention_days")]
    pub backup_retention_days: i64,
}

fn default_max_versions() -> usize {
    10
}

fn default_auto_save_interval() -> u64 {
    300
}

fn default_retention_days() -> i64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_versions_per_item: default_max_versions(),
            auto_save_interval_secs: default_auto_save_interval(),
            backup_retention_days: default_retention_days(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at a specific data directory, defaults elsewhere
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join("revault-config.json")
    }

    /// Load config from a data directory, falling back to defaults
    /// when no config file exists yet.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = Self::config_path(data_dir);
        if !path.exists() {
            return Ok(Self::with_data_dir(data_dir));
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read engine config from {:?}", path))?;
        let mut config: EngineConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse engine config JSON")?;
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    /// Save config into its data directory (atomic tmp+rename)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path(&self.data_dir);
        fs::create_dir_all(&self.data_dir)?;
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
