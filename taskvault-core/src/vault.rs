//! The authoritative file tree: path layout, atomic writes, enumeration.
//!
//! Files are the source of truth. Every write lands in a temporary file that
//! is fsync'd and atomically renamed over the destination, so readers never
//! observe a partial record and a crash after a reported success cannot lose
//! the write.

use crate::error::{CoreError, Result};
use crate::frontmatter::{self, FieldMap};
use crate::models::{Entity, Project, Task};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use taskvault_types::EntityKind;
use walkdir::WalkDir;

const PROJECTS_DIR: &str = "projects";
const TASKS_DIR: &str = "tasks";
const STATE_DIR: &str = ".taskvault";

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn init_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.root.join(PROJECTS_DIR))?;
        fs::create_dir_all(self.root.join(TASKS_DIR))?;
        fs::create_dir_all(self.root.join(STATE_DIR))?;
        Ok(())
    }

    /// Deterministic path for an entity: kind directory, creation year
    /// (tasks also month), then `<date>--<slug>--<id suffix>.md`.
    pub fn resolve_path(&self, entity: &Entity) -> PathBuf {
        let date = entity.created().date_naive();
        let file = format!(
            "{}--{}--{}.md",
            date.format("%Y-%m-%d"),
            entity.slug(),
            entity.id().suffix()
        );
        match entity {
            Entity::Project(_) => self
                .root
                .join(PROJECTS_DIR)
                .join(date.format("%Y").to_string())
                .join(file),
            Entity::Task(_) => self
                .root
                .join(TASKS_DIR)
                .join(date.format("%Y").to_string())
                .join(date.format("%m").to_string())
                .join(file),
        }
    }

    /// Which kind of entity a path under the root holds, if any.
    pub fn classify(&self, path: &Path) -> Option<EntityKind> {
        let rel = path.strip_prefix(&self.root).ok()?;
        if rel.extension().and_then(|e| e.to_str()) != Some("md") {
            return None;
        }
        match rel.iter().next()?.to_str()? {
            PROJECTS_DIR => Some(EntityKind::Project),
            TASKS_DIR => Some(EntityKind::Task),
            _ => None,
        }
    }

    /// Serialize and durably write an entity. `previous` is the entity state
    /// the caller started from; its file supplies the header to mutate (so
    /// unknown keys survive) and is removed if the slug or date moved the
    /// path. Returns the path written.
    pub fn write(&self, entity: &Entity, previous: Option<&Entity>) -> Result<PathBuf> {
        let new_path = self.resolve_path(entity);
        let old_path = previous.map(|p| self.resolve_path(p));

        let mut map = match &old_path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p)?;
                let (map, _) = frontmatter::decode(&raw).map_err(|e| with_path(e, p))?;
                map
            }
            _ => FieldMap::new(),
        };

        let body = match entity {
            Entity::Project(p) => {
                p.write_to(&mut map);
                p.body.as_str()
            }
            Entity::Task(t) => {
                t.write_to(&mut map);
                t.body.as_str()
            }
        };

        let raw = frontmatter::encode(&map, body);
        self.write_atomic(&new_path, raw.as_bytes())?;

        if let Some(old) = old_path {
            if old != new_path && old.exists() {
                fs::remove_file(&old)?;
                sync_dir(old.parent());
            }
        }

        Ok(new_path)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| CoreError::StorageIo(std::io::Error::other("path has no parent")))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| CoreError::StorageIo(e.error))?;
        // The rename itself is only durable once the directory entry is
        // flushed.
        sync_dir(Some(parent));
        Ok(())
    }

    /// Decode and validate one entity file.
    pub fn read(&self, path: &Path) -> Result<Entity> {
        let kind = self.classify(path).ok_or_else(|| CoreError::SchemaViolation {
            path: Some(path.to_path_buf()),
            reason: "not an entity file under projects/ or tasks/".into(),
        })?;

        let raw = fs::read_to_string(path)?;
        let (map, body) = frontmatter::decode(&raw).map_err(|e| with_path(e, path))?;

        let entity = match kind {
            EntityKind::Project => Entity::Project(
                Project::from_parts(&map, &body).map_err(|e| with_path(e, path))?,
            ),
            EntityKind::Task => {
                Entity::Task(Task::from_parts(&map, &body).map_err(|e| with_path(e, path))?)
            }
        };
        Ok(entity)
    }

    /// Remove an entity's file. Missing files are fine (the external editor
    /// may have beaten us to it).
    pub fn remove(&self, entity: &Entity) -> Result<()> {
        let path = self.resolve_path(entity);
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(path.parent());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lazily list every entity file under the root. Rebuild only; normal
    /// reads go through the index.
    pub fn enumerate(&self) -> impl Iterator<Item = PathBuf> + '_ {
        [PROJECTS_DIR, TASKS_DIR].into_iter().flat_map(|dir| {
            WalkDir::new(self.root.join(dir))
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().to_path_buf())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        })
    }
}

fn with_path(err: CoreError, path: &Path) -> CoreError {
    match err {
        CoreError::MalformedRecord { reason, .. } => CoreError::MalformedRecord {
            path: Some(path.to_path_buf()),
            reason,
        },
        CoreError::SchemaViolation { reason, .. } => CoreError::SchemaViolation {
            path: Some(path.to_path_buf()),
            reason,
        },
        other => other,
    }
}

fn sync_dir(dir: Option<&Path>) {
    // POSIX requires the parent directory flushed for rename durability;
    // opening a directory read-only fails on some platforms, so a miss here
    // is not an error.
    if let Some(dir) = dir {
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, ProjectStatus, Status};
    use chrono::{TimeZone, Utc};
    use taskvault_types::EntityId;

    fn fixed_time() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    fn sample_task() -> Task {
        let now = fixed_time();
        Task {
            id: EntityId::generate(),
            slug: "water-plants".into(),
            project: EntityId::generate(),
            parent: None,
            title: "Water plants".into(),
            status: Status::Todo,
            priority: Priority::None,
            tags: vec!["home".into()],
            due: None,
            start: None,
            done_at: None,
            recur: None,
            estimate_min: None,
            actual_min: None,
            assignee: None,
            sort_order: 1.0,
            created: now,
            updated: now,
            body: "Balcony first.\n".into(),
        }
    }

    fn sample_project() -> Project {
        let now = fixed_time();
        Project {
            id: EntityId::generate(),
            slug: "home".into(),
            title: "Home".into(),
            status: ProjectStatus::Active,
            tags: vec![],
            sort_order: 0.0,
            created: now,
            updated: now,
            body: String::new(),
        }
    }

    #[test]
    fn test_path_layout() {
        let vault = Vault::new("/vault");
        let task = sample_task();
        let path = vault.resolve_path(&Entity::Task(task.clone()));
        let expected = format!(
            "/vault/tasks/2025/09/2025-09-01--water-plants--{}.md",
            task.id.suffix()
        );
        assert_eq!(path, PathBuf::from(expected));

        let project = sample_project();
        let path = vault.resolve_path(&Entity::Project(project.clone()));
        assert!(path
            .to_string_lossy()
            .contains("projects/2025/2025-09-01--home--"));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.init_dirs().unwrap();

        let task = sample_task();
        let path = vault.write(&Entity::Task(task.clone()), None).unwrap();
        assert!(path.exists());

        let reread = vault.read(&path).unwrap();
        match reread {
            Entity::Task(t) => {
                assert_eq!(t.id, task.id);
                assert_eq!(t.body, task.body);
            }
            _ => panic!("expected a task"),
        }
    }

    #[test]
    fn test_slug_change_moves_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.init_dirs().unwrap();

        let task = sample_task();
        let old_path = vault.write(&Entity::Task(task.clone()), None).unwrap();

        let mut renamed = task.clone();
        renamed.slug = "water-the-plants".into();
        renamed.title = "Water the plants".into();
        let new_path = vault
            .write(&Entity::Task(renamed), Some(&Entity::Task(task)))
            .unwrap();

        assert_ne!(old_path, new_path);
        assert!(!old_path.exists());
        assert!(new_path.exists());
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.init_dirs().unwrap();

        let task = sample_task();
        let path = vault.write(&Entity::Task(task.clone()), None).unwrap();

        // An external tool adds a key the schema does not know.
        let raw = fs::read_to_string(&path).unwrap();
        let annotated = raw.replace("status: todo\n", "status: todo\nx-zettel: K42\n");
        fs::write(&path, annotated).unwrap();

        let mut updated = task.clone();
        updated.status = Status::Doing;
        vault
            .write(&Entity::Task(updated), Some(&Entity::Task(task)))
            .unwrap();

        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("x-zettel: K42"));
        assert!(rewritten.contains("status: doing"));
    }

    #[test]
    fn test_read_rejects_malformed_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.init_dirs().unwrap();

        let bad = dir.path().join("tasks/2025/09/2025-09-01--x--abc123.md");
        fs::create_dir_all(bad.parent().unwrap()).unwrap();

        fs::write(&bad, "no frontmatter at all").unwrap();
        assert!(matches!(
            vault.read(&bad),
            Err(CoreError::MalformedRecord { .. })
        ));

        fs::write(&bad, "---\nslug: x\n---\n").unwrap();
        assert!(matches!(
            vault.read(&bad),
            Err(CoreError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_enumerate_finds_both_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path());
        vault.init_dirs().unwrap();

        vault.write(&Entity::Task(sample_task()), None).unwrap();
        vault
            .write(&Entity::Project(sample_project()), None)
            .unwrap();
        // State files must not be enumerated.
        fs::write(dir.path().join(STATE_DIR).join("index.db"), b"x").unwrap();

        let files: Vec<_> = vault.enumerate().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_classify() {
        let vault = Vault::new("/v");
        assert_eq!(
            vault.classify(Path::new("/v/tasks/2025/09/a--b--c.md")),
            Some(EntityKind::Task)
        );
        assert_eq!(
            vault.classify(Path::new("/v/projects/2025/a--b--c.md")),
            Some(EntityKind::Project)
        );
        assert_eq!(vault.classify(Path::new("/v/.taskvault/index.db")), None);
        assert_eq!(vault.classify(Path::new("/elsewhere/x.md")), None);
    }
}
