//! Error taxonomy shared by every core operation.
//!
//! Calling layers match on these variants to render actionable messages, so
//! every operation returns a specific category rather than a generic failure.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The frontmatter header is missing its delimiter or a line does not
    /// parse as `key: value`.
    #[error("malformed record{}: {reason}", path_suffix(.path))]
    MalformedRecord {
        path: Option<PathBuf>,
        reason: String,
    },

    /// The file decoded, but required fields are absent or carry values the
    /// schema rejects (bad timestamp, unknown status).
    #[error("schema violation{}: {reason}", path_suffix(.path))]
    SchemaViolation {
        path: Option<PathBuf>,
        reason: String,
    },

    /// Frontmatter values nest deeper than one level of mapping.
    #[error("unsupported value shape for key '{key}'")]
    UnsupportedShape { key: String },

    /// No live entity matches the given handle.
    #[error("no entity matches '{handle}'")]
    NotFound { handle: String },

    /// An id prefix matched more than one live entity.
    #[error("'{handle}' is ambiguous ({} candidates)", .candidates.len())]
    AmbiguousHandle {
        handle: String,
        candidates: Vec<String>,
    },

    /// The requested reparent would close a loop in the parent chain.
    #[error("reparenting {task} under {parent} would create a cycle")]
    CycleDetected { task: String, parent: String },

    /// Parent and child would end up in different projects.
    #[error("task {task} belongs to a different project than {parent}")]
    ProjectMismatch { task: String, parent: String },

    /// Deletion refused because children exist and no cascade was requested.
    #[error("{id} has {count} child task(s); pass a cascade policy to delete")]
    HasChildren { id: String, count: usize },

    /// A query clause names a field the index does not mirror.
    #[error("unknown query field '{field}'")]
    UnknownField { field: String },

    /// A query clause carries a value the field cannot accept.
    #[error("invalid value in clause '{clause}': {reason}")]
    InvalidValue { clause: String, reason: String },

    /// The authoritative write succeeded but the index update did not; the
    /// entity is queued for lazy re-sync. Non-fatal.
    #[error("index update failed for {id} (file write succeeded): {reason}")]
    IndexDesync { id: String, reason: String },

    /// Disk-level failure. Fatal for the current operation only.
    #[error("storage i/o: {0}")]
    StorageIo(#[from] std::io::Error),

    /// Index database failure outside the desync path (open, migrate, query).
    #[error("index database: {0}")]
    Index(#[from] rusqlite::Error),
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl CoreError {
    /// Errors that mean the index itself is unusable and should be rebuilt
    /// from the vault, as opposed to a bad request or a bad file.
    pub fn is_index_corruption(&self) -> bool {
        match self {
            CoreError::Index(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_category() {
        let err = CoreError::CycleDetected {
            task: "A".into(),
            parent: "B".into(),
        };
        assert!(err.to_string().contains("cycle"));

        let err = CoreError::AmbiguousHandle {
            handle: "01J".into(),
            candidates: vec!["a".into(), "b".into()],
        };
        assert!(err.to_string().contains("2 candidates"));
    }

    #[test]
    fn test_malformed_record_includes_path() {
        let err = CoreError::MalformedRecord {
            path: Some(PathBuf::from("tasks/2025/09/x.md")),
            reason: "missing closing delimiter".into(),
        };
        assert!(err.to_string().contains("tasks/2025/09/x.md"));
    }
}
