use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::history::DEFAULT_CAPACITY;

/// Settings handed to [`crate::sync::SyncEngine::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub keys: StorageKeys,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_expires_in_days")]
    pub expires_in_days: u32,
    /// Directory of the file-backed local store. Defaults to the platform
    /// data directory.
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            keys: StorageKeys::default(),
            max_history: default_max_history(),
            expires_in_days: default_expires_in_days(),
            local_dir: None,
        }
    }
}

/// Local-store keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageKeys {
    #[serde(default = "default_tasks_key")]
    pub tasks: String,
    #[serde(default = "default_migration_flag_key")]
    pub migration_flag: String,
    #[serde(default = "default_undo_key")]
    pub undo_history: String,
    #[serde(default = "default_redo_key")]
    pub redo_history: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            tasks: default_tasks_key(),
            migration_flag: default_migration_flag_key(),
            undo_history: default_undo_key(),
            redo_history: default_redo_key(),
        }
    }
}

impl StorageKeys {
    fn all(&self) -> [&str; 4] {
        [
            self.tasks.as_str(),
            self.migration_flag.as_str(),
            self.undo_history.as_str(),
            self.redo_history.as_str(),
        ]
    }
}

impl SyncConfig {
    /// Parse TOML text. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Fails on TOML syntax errors or invalid values.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse ladder config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Check invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// Fails when `max_history` is zero or a key is blank or shared.
    pub fn validate(&self) -> Result<()> {
        if self.max_history == 0 {
            bail!("max_history must be at least 1");
        }
        let mut seen = HashSet::new();
        for key in self.keys.all() {
            if key.trim().is_empty() {
                bail!("storage keys must not be blank");
            }
            if !seen.insert(key) {
                bail!("storage key '{key}' is used more than once");
            }
        }
        Ok(())
    }

    /// Directory for [`crate::store::FileLocalStore`].
    #[must_use]
    pub fn resolved_local_dir(&self) -> PathBuf {
        self.local_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("ladder")
        })
    }
}

const fn default_max_history() -> usize {
    DEFAULT_CAPACITY
}

const fn default_expires_in_days() -> u32 {
    365
}

fn default_tasks_key() -> String {
    "tasks".to_string()
}

fn default_migration_flag_key() -> String {
    "tasks_migrated_to_remote".to_string()
}

fn default_undo_key() -> String {
    "tasks_history".to_string()
}

fn default_redo_key() -> String {
    "tasks_redo_history".to_string()
}
