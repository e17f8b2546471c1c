//! The derived, rebuildable query mirror.
//!
//! SQLite tables mirror every queryable column; an FTS5 table covers task
//! title/body/tags. The index is strictly a projection of the vault: it is
//! never the source of any field value and can be rebuilt from files at any
//! time. Rebuilds populate a shadow database file and swap it in atomically,
//! so concurrent readers see the old or the new index, never a half-built
//! one.

use crate::error::{CoreError, Result};
use crate::models::{Entity, Priority, Status};
use crate::vault::Vault;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use taskvault_types::{EntityId, EntityKind};

const SCHEMA_VERSION: &str = "1";

#[derive(Debug)]
pub struct IndexStore {
    path: PathBuf,
    conn: parking_lot::Mutex<Connection>,
}

/// Mirrored columns for one task. The body lives in the vault; `path` says
/// where to fetch it.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: EntityId,
    pub slug: String,
    pub project_id: EntityId,
    pub parent_id: Option<EntityId>,
    pub title: String,
    pub status: Status,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub due: Option<chrono::NaiveDate>,
    pub start: Option<chrono::NaiveDate>,
    pub sort_order: f64,
    pub created: String,
    pub updated: String,
    pub path: String,
}

/// Mirrored columns for one project.
#[derive(Debug, Clone)]
pub struct ProjectRow {
    pub id: EntityId,
    pub slug: String,
    pub title: String,
    pub status: String,
    pub tags: Vec<String>,
    pub sort_order: f64,
    pub created: String,
    pub path: String,
}

/// Predicate and sort compiled by the query engine, executed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    /// WHERE fragment over the `t` (tasks) alias, positional placeholders.
    pub where_sql: String,
    pub params: Vec<String>,
    /// ORDER BY fragment; always ends with the stable tie-break.
    pub order_sql: String,
}

/// Outcome of a full rebuild.
#[derive(Debug, Default)]
pub struct RebuildStats {
    pub scanned: usize,
    pub indexed_projects: usize,
    pub indexed_tasks: usize,
    /// Files that failed to decode or validate, with the reason. A bad file
    /// never blocks the rest of the corpus.
    pub skipped: Vec<(PathBuf, String)>,
    pub cancelled: bool,
}

impl IndexStore {
    /// Open (creating and migrating if needed) the index at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = open_connection(&path)?;
        Ok(Self {
            path,
            conn: parking_lot::Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace all mirrored columns and full-text fields for one entity.
    /// Idempotent: re-upserting identical content is a no-op for queries.
    pub fn upsert(&self, entity: &Entity, rel_path: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert_row(&tx, entity, rel_path)?;
        tx.commit()?;
        Ok(())
    }

    /// Drop an entity from the mirror. Unknown ids are fine.
    pub fn delete(&self, id: &EntityId) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        delete_row(&tx, id.as_str())?;
        tx.commit()?;
        Ok(())
    }

    pub fn task(&self, id: &EntityId) -> Result<Option<TaskRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{TASK_SELECT} WHERE t.id = ?1"),
                params![id.as_str()],
                task_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn project(&self, id: &EntityId) -> Result<Option<ProjectRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{PROJECT_SELECT} WHERE p.id = ?1"),
                params![id.as_str()],
                project_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn project_by_slug(&self, slug: &str) -> Result<Option<ProjectRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{PROJECT_SELECT} WHERE p.slug = ?1"),
                params![slug],
                project_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All projects, stable order: sort position, then title.
    pub fn projects(&self) -> Result<Vec<ProjectRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{PROJECT_SELECT} ORDER BY p.sort_order, p.title, p.id"))?;
        let rows = stmt
            .query_map([], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Direct children of a task, sibling order.
    pub fn children(&self, parent: &EntityId) -> Result<Vec<TaskRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{TASK_SELECT} WHERE t.parent_id = ?1 ORDER BY t.sort_order, t.created, t.id"
        ))?;
        let rows = stmt
            .query_map(params![parent.as_str()], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sibling run: tasks sharing a parent, or a project's top level.
    pub fn siblings(
        &self,
        project: &EntityId,
        parent: Option<&EntityId>,
    ) -> Result<Vec<TaskRow>> {
        let conn = self.conn.lock();
        let rows = match parent {
            Some(parent) => {
                let mut stmt = conn.prepare(&format!(
                    "{TASK_SELECT} WHERE t.parent_id = ?1 ORDER BY t.sort_order, t.created, t.id"
                ))?;
                let rows = stmt
                    .query_map(params![parent.as_str()], task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{TASK_SELECT} WHERE t.project_id = ?1 AND t.parent_id IS NULL \
                     ORDER BY t.sort_order, t.created, t.id"
                ))?;
                let rows = stmt
                    .query_map(params![project.as_str()], task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Every task id in the subtree under `root`, excluding `root` itself.
    pub fn descendant_ids(&self, root: &EntityId) -> Result<Vec<EntityId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "WITH RECURSIVE sub(id) AS ( \
               SELECT id FROM tasks WHERE parent_id = ?1 \
               UNION ALL \
               SELECT t.id FROM tasks t JOIN sub ON t.parent_id = sub.id \
             ) SELECT id FROM sub",
        )?;
        let ids = stmt
            .query_map(params![root.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().filter_map(|s| EntityId::parse(&s)).collect())
    }

    /// Done and total counts over direct children, for roll-up.
    pub fn child_stats(&self, parent: &EntityId) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let (done, total): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(status = 'done'), 0), COUNT(*) \
             FROM tasks WHERE parent_id = ?1",
            params![parent.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((done as usize, total as usize))
    }

    pub fn task_count_in_project(&self, project: &EntityId) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE project_id = ?1",
            params![project.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn tasks_in_project(&self, project: &EntityId) -> Result<Vec<TaskRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{TASK_SELECT} WHERE t.project_id = ?1 ORDER BY t.created, t.id"
        ))?;
        let rows = stmt
            .query_map(params![project.as_str()], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Handle resolution probes. Each returns (kind, id) pairs of live
    /// entities, creation order.
    pub fn ids_matching_exact(&self, text: &str) -> Result<Vec<(EntityKind, EntityId)>> {
        self.id_probe("SELECT 'task', id FROM tasks WHERE id = ?1 \
                       UNION ALL SELECT 'project', id FROM projects WHERE id = ?1", text)
    }

    pub fn ids_matching_slug(&self, slug: &str) -> Result<Vec<(EntityKind, EntityId)>> {
        self.id_probe(
            "SELECT 'task', id FROM tasks WHERE slug = ?1 \
             UNION ALL SELECT 'project', id FROM projects WHERE slug = ?1",
            slug,
        )
    }

    pub fn ids_matching_date_slug(
        &self,
        date: &str,
        slug: &str,
    ) -> Result<Vec<(EntityKind, EntityId)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT 'task', id, created FROM tasks \
               WHERE slug = ?2 AND substr(created, 1, 10) = ?1 \
             UNION ALL \
             SELECT 'project', id, created FROM projects \
               WHERE slug = ?2 AND substr(created, 1, 10) = ?1 \
             ORDER BY 3, 2",
        )?;
        let rows = stmt
            .query_map(params![date, slug], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_kind_ids(rows))
    }

    pub fn ids_matching_prefix(&self, prefix: &str) -> Result<Vec<(EntityKind, EntityId)>> {
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT 'task', id FROM tasks WHERE id LIKE ?1 \
             UNION ALL SELECT 'project', id FROM projects WHERE id LIKE ?1 \
             ORDER BY 2",
        )?;
        let rows = stmt
            .query_map(params![pattern], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_kind_ids(rows))
    }

    fn id_probe(&self, sql: &str, arg: &str) -> Result<Vec<(EntityKind, EntityId)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![arg], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_kind_ids(rows))
    }

    /// The entity mirrored from a vault-relative path, if any. Used when a
    /// file disappears and only its path is known.
    pub fn entity_at_path(&self, rel: &str) -> Result<Option<(EntityKind, EntityId)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT 'task', id FROM tasks WHERE path = ?1 \
                 UNION ALL SELECT 'project', id FROM projects WHERE path = ?1",
                params![rel],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|pair| decode_kind_ids(vec![pair]).into_iter().next()))
    }

    /// Execute a compiled predicate and sort, returning ordered task ids.
    pub fn run_compiled(&self, query: &CompiledQuery) -> Result<Vec<EntityId>> {
        let sql = format!(
            "SELECT t.id FROM tasks t WHERE {} ORDER BY {}",
            query.where_sql, query.order_sql
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(
                rusqlite::params_from_iter(query.params.iter()),
                |row| row.get::<_, String>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().filter_map(|s| EntityId::parse(&s)).collect())
    }

    /// Drop everything and repopulate from a full vault enumeration.
    ///
    /// Builds into a shadow file, then swaps via atomic rename. Per-file
    /// decode failures are recorded and skipped. Cancellation between
    /// records abandons the shadow and leaves the live index untouched.
    pub fn rebuild(&self, vault: &Vault, cancel: Option<&AtomicBool>) -> Result<RebuildStats> {
        let shadow_path = self.path.with_extension("rebuild");
        remove_db_files(&shadow_path);

        let mut shadow = open_connection(&shadow_path)?;
        let mut stats = RebuildStats::default();

        let tx = shadow.transaction()?;
        for path in vault.enumerate() {
            if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false) {
                stats.cancelled = true;
                break;
            }
            stats.scanned += 1;
            match vault.read(&path) {
                Ok(entity) => {
                    let rel = rel_path(vault, &path);
                    upsert_row(&tx, &entity, &rel)?;
                    match entity {
                        Entity::Project(_) => stats.indexed_projects += 1,
                        Entity::Task(_) => stats.indexed_tasks += 1,
                    }
                }
                Err(err) => {
                    tracing::warn!("skipping {} during rebuild: {}", path.display(), err);
                    stats.skipped.push((path, err.to_string()));
                }
            }
        }

        if stats.cancelled {
            drop(tx);
            drop(shadow);
            remove_db_files(&shadow_path);
            tracing::info!("rebuild cancelled after {} files", stats.scanned);
            return Ok(stats);
        }

        tx.commit()?;
        // Flush the WAL into the main shadow file before the rename.
        shadow.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        drop(shadow);

        // Close the live connection first so its -wal/-shm sidecars are
        // checkpointed and removed, then slide the shadow into place.
        let mut guard = self.conn.lock();
        let placeholder = Connection::open_in_memory()?;
        drop(std::mem::replace(&mut *guard, placeholder));
        fs::rename(&shadow_path, &self.path)?;
        *guard = open_connection(&self.path)?;

        tracing::info!(
            "rebuilt index: {} projects, {} tasks, {} skipped",
            stats.indexed_projects,
            stats.indexed_tasks,
            stats.skipped.len()
        );
        Ok(stats)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
          id TEXT PRIMARY KEY,
          slug TEXT NOT NULL,
          title TEXT NOT NULL,
          status TEXT NOT NULL,
          tags TEXT NOT NULL,
          sort_order REAL NOT NULL,
          created TEXT NOT NULL,
          updated TEXT NOT NULL,
          path TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
          id TEXT PRIMARY KEY,
          slug TEXT NOT NULL,
          project_id TEXT NOT NULL,
          parent_id TEXT,
          title TEXT NOT NULL,
          status TEXT NOT NULL,
          priority INTEGER NOT NULL,
          tags TEXT NOT NULL,
          due TEXT,
          start TEXT,
          done_at TEXT,
          assignee TEXT,
          estimate_min INTEGER,
          actual_min INTEGER,
          sort_order REAL NOT NULL,
          created TEXT NOT NULL,
          updated TEXT NOT NULL,
          path TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_projects_slug ON projects(slug);
        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(due);

        CREATE VIRTUAL TABLE IF NOT EXISTS tasks_fts
          USING fts5(id UNINDEXED, title, body, tags);
        "#,
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO meta(key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(conn)
}

const TASK_SELECT: &str = "SELECT t.id, t.slug, t.project_id, t.parent_id, t.title, t.status, \
     t.priority, t.tags, t.due, t.start, t.sort_order, t.created, t.updated, t.path FROM tasks t";

const PROJECT_SELECT: &str =
    "SELECT p.id, p.slug, p.title, p.status, p.tags, p.sort_order, p.created, p.path \
     FROM projects p";

fn upsert_row(conn: &Connection, entity: &Entity, rel_path: &str) -> rusqlite::Result<()> {
    match entity {
        Entity::Project(p) => {
            conn.execute(
                "INSERT OR REPLACE INTO projects \
                   (id, slug, title, status, tags, sort_order, created, updated, path) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    p.id.as_str(),
                    p.slug,
                    p.title,
                    p.status.as_str(),
                    p.tags.join(" "),
                    p.sort_order,
                    crate::models::format_timestamp(&p.created),
                    crate::models::format_timestamp(&p.updated),
                    rel_path,
                ],
            )?;
        }
        Entity::Task(t) => {
            conn.execute(
                "INSERT OR REPLACE INTO tasks \
                   (id, slug, project_id, parent_id, title, status, priority, tags, \
                    due, start, done_at, assignee, estimate_min, actual_min, \
                    sort_order, created, updated, path) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                params![
                    t.id.as_str(),
                    t.slug,
                    t.project.as_str(),
                    t.parent.as_ref().map(|p| p.as_str()),
                    t.title,
                    t.status.as_str(),
                    t.priority.rank(),
                    t.tags.join(" "),
                    t.due.map(|d| d.to_string()),
                    t.start.map(|d| d.to_string()),
                    t.done_at.as_ref().map(crate::models::format_timestamp),
                    t.assignee,
                    t.estimate_min,
                    t.actual_min,
                    t.sort_order,
                    crate::models::format_timestamp(&t.created),
                    crate::models::format_timestamp(&t.updated),
                    rel_path,
                ],
            )?;
            conn.execute("DELETE FROM tasks_fts WHERE id = ?1", params![t.id.as_str()])?;
            conn.execute(
                "INSERT INTO tasks_fts (id, title, body, tags) VALUES (?1,?2,?3,?4)",
                params![t.id.as_str(), t.title, t.body, t.tags.join(" ")],
            )?;
        }
    }
    Ok(())
}

fn delete_row(conn: &Connection, id: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
    conn.execute("DELETE FROM tasks_fts WHERE id = ?1", params![id])?;
    conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
    Ok(())
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(2)?;
    let parent_id: Option<String> = row.get(3)?;
    let status: String = row.get(5)?;
    let priority: i64 = row.get(6)?;
    let tags: String = row.get(7)?;
    let due: Option<String> = row.get(8)?;
    let start: Option<String> = row.get(9)?;

    Ok(TaskRow {
        id: parse_col(0, EntityId::parse(&id))?,
        slug: row.get(1)?,
        project_id: parse_col(2, EntityId::parse(&project_id))?,
        parent_id: match parent_id {
            Some(p) => Some(parse_col(3, EntityId::parse(&p))?),
            None => None,
        },
        title: row.get(4)?,
        status: parse_col(5, Status::parse(&status))?,
        priority: parse_col(6, priority_from_rank(priority))?,
        tags: split_tags(&tags),
        due: match due {
            Some(d) => Some(parse_col(8, d.parse().ok())?),
            None => None,
        },
        start: match start {
            Some(d) => Some(parse_col(9, d.parse().ok())?),
            None => None,
        },
        sort_order: row.get(10)?,
        created: row.get(11)?,
        updated: row.get(12)?,
        path: row.get(13)?,
    })
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    let id: String = row.get(0)?;
    let tags: String = row.get(4)?;
    Ok(ProjectRow {
        id: parse_col(0, EntityId::parse(&id))?,
        slug: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        tags: split_tags(&tags),
        sort_order: row.get(5)?,
        created: row.get(6)?,
        path: row.get(7)?,
    })
}

fn parse_col<T>(idx: usize, value: Option<T>) -> rusqlite::Result<T> {
    value.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            "mirrored column failed to parse".into(),
        )
    })
}

fn priority_from_rank(rank: i64) -> Option<Priority> {
    match rank {
        0 => Some(Priority::None),
        1 => Some(Priority::Low),
        2 => Some(Priority::Med),
        3 => Some(Priority::High),
        4 => Some(Priority::Urgent),
        _ => None,
    }
}

fn split_tags(joined: &str) -> Vec<String> {
    joined
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

fn decode_kind_ids(rows: Vec<(String, String)>) -> Vec<(EntityKind, EntityId)> {
    rows.into_iter()
        .filter_map(|(kind, id)| {
            let kind = match kind.as_str() {
                "project" => EntityKind::Project,
                "task" => EntityKind::Task,
                _ => return None,
            };
            EntityId::parse(&id).map(|id| (kind, id))
        })
        .collect()
}

/// Relative path stored in the mirror for later hydration from the vault.
pub fn rel_path(vault: &Vault, path: &Path) -> String {
    path.strip_prefix(vault.root())
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

pub(crate) fn remove_db_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        let _ = fs::remove_file(PathBuf::from(name));
    }
}
