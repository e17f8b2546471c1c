//! Append-only audit trail.
//!
//! One JSON line per committed mutation, written in the same logical unit
//! as the authoritative file. The log exists for future undo/audit; current
//! state is never reconstructed from it.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use taskvault_types::{EntityId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    SetStatus,
    Reparent,
    Reorder,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub entity: EntityKind,
    pub id: EntityId,
    pub action: Action,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record durably.
    pub fn append(&self, record: &EventRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    /// Every record in append order. Audit/debug surface, not a hot path.
    pub fn read_all(&self) -> Result<Vec<EventRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!("skipping unreadable event line: {err}"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("state/events.jsonl"));

        let id = EntityId::generate();
        for action in [Action::Create, Action::SetStatus] {
            log.append(&EventRecord {
                entity: EntityKind::Task,
                id: id.clone(),
                action,
                payload: json!({"status": "doing"}),
                timestamp: Utc::now(),
                actor: "core".into(),
            })
            .unwrap();
        }

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, Action::Create);
        assert_eq!(records[1].action, Action::SetStatus);
        assert_eq!(records[1].id, id);
    }

    #[test]
    fn test_unreadable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        fs::write(&path, "not json\n").unwrap();

        let log = EventLog::new(&path);
        log.append(&EventRecord {
            entity: EntityKind::Project,
            id: EntityId::generate(),
            action: Action::Create,
            payload: json!({}),
            timestamp: Utc::now(),
            actor: "core".into(),
        })
        .unwrap();

        assert_eq!(log.read_all().unwrap().len(), 1);
    }
}
