//! Store configuration
//!
//! Stored as `revstore.json` next to the database. A missing file means
//! defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, VcsError};

/// Name of the configuration file inside a repository directory
pub const CONFIG_FILE: &str = "revstore.json";

/// Repository-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix prepended to every SQLite table name
    pub table_prefix: String,
    /// SQLite database file name, relative to the repository directory
    pub database_file: String,
    /// A diff is kept only when it is smaller than `base / divisor`
    pub diff_threshold_divisor: u64,
    /// Use the WAL journal for file databases
    pub wal: bool,
    /// Reject empty content when storing revisions
    pub require_content: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_prefix: "vc_".to_string(),
            database_file: "revstore.db".to_string(),
            diff_threshold_divisor: 3,
            wal: true,
            require_content: false,
        }
    }
}

impl StoreConfig {
    /// Load config from a repository directory
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: StoreConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a repository directory
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        self.validate()?;
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    /// Table prefixes end up in SQL text, so only identifier characters pass
    pub fn validate(&self) -> Result<()> {
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(VcsError::InvalidConfig(format!(
                "table prefix {:?} may only contain ASCII letters, digits and underscores",
                self.table_prefix
            )));
        }
        if self.diff_threshold_divisor == 0 {
            return Err(VcsError::InvalidConfig(
                "diff_threshold_divisor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings consumed by the revision manager
    pub fn revision_config(&self) -> RevisionConfig {
        RevisionConfig {
            diff_threshold_divisor: self.diff_threshold_divisor,
            require_content: self.require_content,
        }
    }
}

/// Revision manager settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionConfig {
    pub diff_threshold_divisor: u64,
    pub require_content: bool,
}

impl Default for RevisionConfig {
    fn default() -> Self {
        StoreConfig::default().revision_config()
    }
}
