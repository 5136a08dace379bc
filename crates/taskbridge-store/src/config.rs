//! Injected configuration for a reconcile run.
//!
//! Nothing in the pipeline reaches into the environment or the home
//! directory: every entry point takes a `SyncConfig`, and tests supply
//! synthetic ones pointing at temporary directories.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One markdown vault to index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultConfig {
    pub name: String,
    pub path: PathBuf,
}

/// One reminders list to enumerate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListConfig {
    pub name: String,
    pub identifier: String,
}

/// Per-direction bounds on counterpart creations per run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreationCaps {
    pub md_to_rem: usize,
    pub rem_to_md: usize,
}

impl Default for CreationCaps {
    fn default() -> Self {
        Self {
            md_to_rem: 50,
            rem_to_md: 50,
        }
    }
}

fn default_min_score() -> f64 {
    taskbridge_core::domain::constants::DEFAULT_MIN_SCORE
}

fn default_days_tolerance() -> i64 {
    taskbridge_core::domain::constants::DEFAULT_DAYS_TOLERANCE
}

fn default_creation_age_days() -> i64 {
    14
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_json_size_cap() -> u64 {
    crate::safe_io::DEFAULT_JSON_SIZE_CAP
}

fn default_exclude_dirs() -> Vec<String> {
    [".obsidian", ".trash", ".recovery_backups"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Configuration for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Vaults to index, in order.
    pub vaults: Vec<VaultConfig>,
    /// Reminders lists to enumerate, in order.
    pub lists: Vec<ListConfig>,
    /// Where indexes, links, changesets and caches are persisted.
    pub state_dir: PathBuf,
    /// Minimum matching score for forming a link.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Due-date tolerance for matching, in days.
    #[serde(default = "default_days_tolerance")]
    pub days_tolerance: i64,
    #[serde(default)]
    pub include_completed_in_matching: bool,
    #[serde(default)]
    pub creation_caps: CreationCaps,
    /// Unlinked tasks older than this never get counterparts.
    #[serde(default = "default_creation_age_days")]
    pub creation_age_days: i64,
    /// Vault receiving rem→md creations; defaults to the first vault.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_creation_vault: Option<String>,
    /// List receiving md→rem creations; defaults to the first list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_creation_list: Option<String>,
    /// Directory names skipped during the vault walk, in addition to every
    /// dot-directory.
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub gateway_timeout_secs: u64,
    #[serde(default = "default_json_size_cap")]
    pub json_size_cap_bytes: u64,
}

impl SyncConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    /// A minimal config for one vault, one list and a state directory.
    pub fn minimal(vault: VaultConfig, list: ListConfig, state_dir: PathBuf) -> Self {
        Self {
            vaults: vec![vault],
            lists: vec![list],
            state_dir,
            min_score: default_min_score(),
            days_tolerance: default_days_tolerance(),
            include_completed_in_matching: false,
            creation_caps: CreationCaps::default(),
            creation_age_days: default_creation_age_days(),
            default_creation_vault: None,
            default_creation_list: None,
            exclude_dirs: default_exclude_dirs(),
            lock_timeout_secs: default_timeout_secs(),
            gateway_timeout_secs: default_timeout_secs(),
            json_size_cap_bytes: default_json_size_cap(),
        }
    }

    /// The vault that receives rem→md creations.
    pub fn creation_vault(&self) -> Option<&VaultConfig> {
        match &self.default_creation_vault {
            Some(name) => self.vaults.iter().find(|v| &v.name == name),
            None => self.vaults.first(),
        }
    }

    /// The list identifier that receives md→rem creations.
    pub fn creation_list(&self) -> Option<&str> {
        match &self.default_creation_list {
            Some(name) => self
                .lists
                .iter()
                .find(|l| &l.name == name || &l.identifier == name)
                .map(|l| l.identifier.as_str()),
            None => self.lists.first().map(|l| l.identifier.as_str()),
        }
    }
}
