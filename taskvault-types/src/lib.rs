//! Shared types for taskvault
//!
//! This crate provides common types used across the taskvault ecosystem,
//! including entity identifiers and vault change events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Entity identifier: a 26-character ULID string.
///
/// ULIDs are globally unique and lexicographically sortable by creation
/// time, so ordering ids orders entities by age.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a fresh id from the current wall clock.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Accept an existing id string, validating that it is a well-formed ULID.
    pub fn parse(s: &str) -> Option<Self> {
        ulid::Ulid::from_string(s)
            .ok()
            .map(|u| Self(u.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short suffix used in filenames (last 6 characters, the random tail).
    pub fn suffix(&self) -> &str {
        &self.0[self.0.len() - 6..]
    }

    /// Milliseconds since the Unix epoch embedded in the ULID.
    pub fn timestamp_ms(&self) -> u64 {
        ulid::Ulid::from_string(&self.0)
            .map(|u| u.timestamp_ms())
            .unwrap_or(0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which kind of entity a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Task,
}

/// A change observed under the vault root, delivered by the file watcher
/// (or synthesized by tests) and consumed by the reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultChange {
    /// A file appeared or its contents changed.
    Upserted { path: PathBuf },

    /// A file was removed.
    Removed { path: PathBuf },
}

impl VaultChange {
    pub fn path(&self) -> &PathBuf {
        match self {
            VaultChange::Upserted { path } => path,
            VaultChange::Removed { path } => path,
        }
    }
}
