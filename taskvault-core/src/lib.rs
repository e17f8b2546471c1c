//! # taskvault-core
//!
//! Persistence and query engine for the taskvault task tracker.
//!
//! The authoritative record is a tree of human-editable text files (the
//! vault); a SQLite mirror (the index) answers queries and can always be
//! rebuilt from the files. This crate provides the codec for the file
//! format, the vault and index stores, the consistency manager binding
//! them, hierarchy invariants, the query DSL, and handle resolution.

pub mod config;
pub mod error;
pub mod events;
pub mod frontmatter;
pub mod hierarchy;
pub mod index;
pub mod models;
pub mod query;
pub mod resolve;
pub mod slug;
pub mod store;
pub mod vault;
pub mod watch;

pub use config::{CompletionPolicy, Config, OrderingStrategy};
pub use error::{CoreError, Result};
pub use events::{Action, EventLog, EventRecord};
pub use frontmatter::{FieldMap, FieldValue};
pub use hierarchy::CascadePolicy;
pub use index::{IndexStore, RebuildStats};
pub use models::{
    Entity, Priority, Project, ProjectStatus, Recurrence, Status, Task,
};
pub use slug::slugify;
pub use store::{
    Applied, Batch, NewProject, NewTask, Position, ProjectCascade, ProjectPatch, Store, TaskPatch,
};
pub use vault::Vault;
pub use watch::{spawn_reconciler, Reconciler};
