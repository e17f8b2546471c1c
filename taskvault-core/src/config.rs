//! Configuration parsing and management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// What `set_status(done)` does when a parent still has open children.
/// The engine exposes the decision point; callers and config pick the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionPolicy {
    /// Refuse with a guarded error.
    Block,
    /// Complete the open descendants too.
    Cascade,
    /// Complete the parent alone.
    Force,
}

/// How sibling positions are reassigned on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingStrategy {
    /// Midpoint between neighbors; renumber the sibling run when the gap
    /// underflows `min_gap`.
    Fractional,
    /// Renumber the whole sibling run on every insert.
    Renumber,
}

/// Core configuration, loaded from `taskvault.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the authoritative file tree.
    pub vault: PathBuf,

    /// Index database location. Defaults to `.taskvault/index.db` under the
    /// vault root.
    #[serde(default)]
    pub index_path: Option<PathBuf>,

    /// Audit log location. Defaults to `.taskvault/events.jsonl` under the
    /// vault root.
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,

    #[serde(default = "default_completion_policy")]
    pub completion_policy: CompletionPolicy,

    #[serde(default = "default_ordering_strategy")]
    pub ordering: OrderingStrategy,

    /// Gap below which fractional ordering renumbers the sibling run.
    #[serde(default = "default_min_gap")]
    pub min_order_gap: f64,

    /// Force task slugs unique across the whole vault. Off by default: the
    /// id suffix already keeps filenames unique, and date+slug handles
    /// disambiguate.
    #[serde(default)]
    pub dedupe_task_slugs: bool,
}

fn default_completion_policy() -> CompletionPolicy {
    CompletionPolicy::Block
}

fn default_ordering_strategy() -> OrderingStrategy {
    OrderingStrategy::Fractional
}

fn default_min_gap() -> f64 {
    1e-6
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration rooted at a vault directory with everything defaulted.
    pub fn with_vault(vault: impl Into<PathBuf>) -> Self {
        Config {
            vault: vault.into(),
            index_path: None,
            event_log_path: None,
            completion_policy: default_completion_policy(),
            ordering: default_ordering_strategy(),
            min_order_gap: default_min_gap(),
            dedupe_task_slugs: false,
        }
    }

    pub fn vault_dir(&self) -> &Path {
        &self.vault
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.vault.join(".taskvault").join("index.db"))
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.event_log_path
            .clone()
            .unwrap_or_else(|| self.vault.join(".taskvault").join("events.jsonl"))
    }
}
