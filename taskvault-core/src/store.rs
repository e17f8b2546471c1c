//! The consistency manager: the single path every mutation flows through.
//!
//! `Store` binds the vault and the index. A mutation writes the
//! authoritative file first, then mirrors it into the index, as one logical
//! unit under the mutation lock. The file is never rolled back: if the
//! index step fails, the operation reports an `IndexDesync` warning next to
//! the successful write and the entity is retried lazily on the next
//! access. If the index proves unusable, it is discarded and rebuilt from
//! the vault, which is always sufficient to reach a correct read state.

use crate::config::{CompletionPolicy, Config};
use crate::error::{CoreError, Result};
use crate::events::{Action, EventLog, EventRecord};
use crate::hierarchy::{self, CascadePolicy, Placement};
use crate::index::{self, IndexStore, RebuildStats};
use crate::models::{
    Entity, Priority, Project, ProjectStatus, Recurrence, Status, Task,
};
use crate::query;
use crate::resolve;
use crate::slug::{dedupe_slug, slug_or_untitled};
use crate::vault::Vault;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use taskvault_types::{EntityId, EntityKind, VaultChange};

/// A successful mutation, possibly carrying a non-fatal warning
/// (`IndexDesync` is the only one).
#[derive(Debug)]
pub struct Applied<T> {
    pub value: T,
    pub warning: Option<CoreError>,
}

impl<T> Applied<T> {
    fn clean(value: T) -> Self {
        Self {
            value,
            warning: None,
        }
    }
}

/// Input for `create_project`.
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub title: String,
    pub tags: Vec<String>,
    pub body: String,
}

/// Input for `create_task`. `project` and `parent` are handles.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub project: String,
    pub parent: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub due: Option<NaiveDate>,
    pub start: Option<NaiveDate>,
    pub assignee: Option<String>,
    pub estimate_min: Option<u32>,
    pub recur: Option<Recurrence>,
    pub body: String,
}

impl NewTask {
    pub fn new(title: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            project: project.into(),
            ..Self::default()
        }
    }
}

/// Field patch for `update_task`. Outer `None` leaves a field alone; inner
/// `None` clears it.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
    pub due: Option<Option<NaiveDate>>,
    pub start: Option<Option<NaiveDate>>,
    pub assignee: Option<Option<String>>,
    pub estimate_min: Option<Option<u32>>,
    pub actual_min: Option<Option<u32>>,
    pub recur: Option<Option<Recurrence>>,
    pub body: Option<String>,
}

/// Field patch for `update_project`.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<ProjectStatus>,
    pub body: Option<String>,
}

/// Sibling placement expressed with handles.
#[derive(Debug, Clone)]
pub enum Position {
    First,
    Last,
    Before(String),
    After(String),
}

/// What to do with a project's tasks when deleting it.
#[derive(Debug, Clone)]
pub enum ProjectCascade {
    Refuse,
    DeleteTasks,
    /// Move every task to this project (handle).
    MigrateTo(String),
}

#[derive(Default)]
struct MutationState {
    /// Foreground write counter per vault-relative path. Reconciliation
    /// snapshots this when an event arrives and skips if a newer foreground
    /// write already re-indexed the file.
    generations: HashMap<String, u64>,
    /// Entities whose index write failed; retried on the next access.
    pending: Vec<PendingSync>,
}

struct PendingSync {
    entity: Entity,
    rel_path: String,
}

pub struct Store {
    config: Config,
    vault: Vault,
    index: IndexStore,
    events: EventLog,
    state: Mutex<MutationState>,
}

impl Store {
    /// Open a vault and its index, rebuilding the index when it is missing
    /// or unreadable. The authoritative files are never touched by
    /// recovery.
    pub fn open(config: Config) -> Result<Self> {
        let vault = Vault::new(config.vault_dir());
        vault.init_dirs()?;

        let index_path = config.index_path();
        let existed = index_path.exists();
        let index = match IndexStore::open(&index_path) {
            Ok(index) => index,
            Err(err) if err.is_index_corruption() => {
                tracing::warn!("index unusable ({err}); discarding and rebuilding");
                index::remove_db_files(&index_path);
                IndexStore::open(&index_path)?
            }
            Err(err) => return Err(err),
        };

        let store = Self {
            events: EventLog::new(config.event_log_path()),
            config,
            vault,
            index,
            state: Mutex::new(MutationState::default()),
        };

        if !existed || !store.index_populated()? {
            store.index.rebuild(&store.vault, None)?;
        }
        Ok(store)
    }

    fn index_populated(&self) -> Result<bool> {
        // An empty index next to a non-empty vault means a stale or fresh
        // mirror either way: rebuild.
        if self.index.projects()?.is_empty() {
            return Ok(self.vault.enumerate().next().is_none());
        }
        Ok(true)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /* ----- create ----- */

    pub fn create_project(&self, new: NewProject) -> Result<Applied<Project>> {
        let mut state = self.state.lock();
        self.create_project_locked(&mut state, new)
    }

    fn create_project_locked(
        &self,
        state: &mut MutationState,
        new: NewProject,
    ) -> Result<Applied<Project>> {
        let base = slug_or_untitled(&new.title);
        let slug = dedupe_slug(&base, |candidate| {
            matches!(self.index.project_by_slug(candidate), Ok(Some(_)))
        });

        let sort_order = self
            .index
            .projects()?
            .iter()
            .map(|p| p.sort_order)
            .fold(0.0_f64, f64::max)
            + 1.0;

        let now = Utc::now();
        let project = Project {
            id: EntityId::generate(),
            slug,
            title: new.title,
            status: ProjectStatus::Active,
            tags: new.tags,
            sort_order,
            created: now,
            updated: now,
            body: new.body,
        };

        let warning = self.commit(
            state,
            None,
            &Entity::Project(project.clone()),
            Action::Create,
            json!({ "title": project.title }),
        )?;
        Ok(Applied {
            value: project,
            warning,
        })
    }

    pub fn create_task(&self, new: NewTask) -> Result<Applied<Task>> {
        let mut state = self.state.lock();
        self.create_task_locked(&mut state, new)
    }

    fn create_task_locked(
        &self,
        state: &mut MutationState,
        new: NewTask,
    ) -> Result<Applied<Task>> {
        let (kind, project_id) = resolve::resolve(&self.index, &new.project)?;
        if kind != EntityKind::Project {
            return Err(CoreError::NotFound {
                handle: new.project.clone(),
            });
        }

        let parent = match &new.parent {
            Some(handle) => {
                let parent_id = resolve::resolve_task(&self.index, handle)?;
                let row = self.index.task(&parent_id)?.ok_or_else(|| CoreError::NotFound {
                    handle: handle.clone(),
                })?;
                if row.project_id != project_id {
                    return Err(CoreError::ProjectMismatch {
                        task: handle.clone(),
                        parent: new.project.clone(),
                    });
                }
                Some(parent_id)
            }
            None => None,
        };

        let base = slug_or_untitled(&new.title);
        let slug = if self.config.dedupe_task_slugs {
            dedupe_slug(&base, |candidate| {
                matches!(self.index.ids_matching_slug(candidate), Ok(hits) if !hits.is_empty())
            })
        } else {
            base
        };

        let sort_order = hierarchy::append_order(&self.index, &project_id, parent.as_ref())?;

        let now = Utc::now();
        let task = Task {
            id: EntityId::generate(),
            slug,
            project: project_id,
            parent,
            title: new.title,
            status: Status::Todo,
            priority: new.priority.unwrap_or(Priority::None),
            tags: new.tags,
            due: new.due,
            start: new.start,
            done_at: None,
            recur: new.recur,
            estimate_min: new.estimate_min,
            actual_min: None,
            assignee: new.assignee,
            sort_order,
            created: now,
            updated: now,
            body: new.body,
        };

        let warning = self.commit(
            state,
            None,
            &Entity::Task(task.clone()),
            Action::Create,
            json!({ "title": task.title }),
        )?;
        Ok(Applied {
            value: task,
            warning,
        })
    }

    /* ----- read ----- */

    pub fn get_task(&self, handle: &str) -> Result<Task> {
        self.heal();
        let id = resolve::resolve_task(&self.index, handle)?;
        self.load_task(&id)
    }

    pub fn get_project(&self, handle: &str) -> Result<Project> {
        self.heal();
        match resolve::resolve(&self.index, handle)? {
            (EntityKind::Project, id) => self.load_project(&id),
            (EntityKind::Task, _) => Err(CoreError::NotFound {
                handle: handle.to_string(),
            }),
        }
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.heal();
        self.index
            .projects()?
            .iter()
            .map(|row| self.load_project(&row.id))
            .collect()
    }

    /// Done-children over total-children for a parent, `None` for a leaf.
    pub fn completion(&self, handle: &str) -> Result<Option<f64>> {
        let id = resolve::resolve_task(&self.index, handle)?;
        hierarchy::completion_ratio(&self.index, &id)
    }

    /// A task's due date as queries see it: its own, or the latest among
    /// its children.
    pub fn effective_due(&self, handle: &str) -> Result<Option<NaiveDate>> {
        let id = resolve::resolve_task(&self.index, handle)?;
        let row = self.index.task(&id)?.ok_or_else(|| CoreError::NotFound {
            handle: handle.to_string(),
        })?;
        hierarchy::effective_due(&self.index, &row)
    }

    pub fn resolve_handle(&self, text: &str) -> Result<(EntityKind, EntityId)> {
        self.heal();
        resolve::resolve(&self.index, text)
    }

    /* ----- query ----- */

    /// Parse, compile, and run a DSL query, returning ordered task ids.
    /// A corrupt index is rebuilt from the vault and the query retried.
    pub fn run_query(&self, text: &str) -> Result<Vec<EntityId>> {
        self.heal();
        let parsed = query::parse(text)?;
        let compiled = query::compile(&parsed);
        match self.index.run_compiled(&compiled) {
            Ok(ids) => Ok(ids),
            Err(err) if err.is_index_corruption() => {
                tracing::warn!("query hit an unusable index ({err}); rebuilding");
                self.index.rebuild(&self.vault, None)?;
                self.index.run_compiled(&compiled)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop and repopulate the index from a full vault enumeration.
    pub fn reindex(&self) -> Result<RebuildStats> {
        let mut state = self.state.lock();
        state.pending.clear();
        self.index.rebuild(&self.vault, None)
    }

    /* ----- field mutations ----- */

    pub fn update_task(&self, handle: &str, patch: TaskPatch) -> Result<Applied<Task>> {
        let mut state = self.state.lock();
        self.update_task_locked(&mut state, handle, patch)
    }

    fn update_task_locked(
        &self,
        state: &mut MutationState,
        handle: &str,
        patch: TaskPatch,
    ) -> Result<Applied<Task>> {
        let id = resolve::resolve_task(&self.index, handle)?;
        let before = self.load_task(&id)?;
        let mut task = before.clone();

        let mut touched: Vec<&str> = Vec::new();
        if let Some(title) = patch.title {
            task.title = title;
            touched.push("title");
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
            touched.push("priority");
        }
        if let Some(tags) = patch.tags {
            task.tags = tags;
            touched.push("tags");
        }
        if let Some(due) = patch.due {
            task.due = due;
            touched.push("due");
        }
        if let Some(start) = patch.start {
            task.start = start;
            touched.push("start");
        }
        if let Some(assignee) = patch.assignee {
            task.assignee = assignee;
            touched.push("assignee");
        }
        if let Some(estimate) = patch.estimate_min {
            task.estimate_min = estimate;
            touched.push("estimate");
        }
        if let Some(actual) = patch.actual_min {
            task.actual_min = actual;
            touched.push("actual");
        }
        if let Some(recur) = patch.recur {
            task.recur = recur;
            touched.push("recur");
        }
        if let Some(body) = patch.body {
            task.body = body;
            touched.push("body");
        }

        if touched.is_empty() {
            return Ok(Applied::clean(task));
        }
        task.updated = Utc::now();

        let warning = self.commit(
            state,
            Some(&Entity::Task(before)),
            &Entity::Task(task.clone()),
            Action::Update,
            json!({ "fields": touched }),
        )?;
        Ok(Applied {
            value: task,
            warning,
        })
    }

    pub fn update_project(&self, handle: &str, patch: ProjectPatch) -> Result<Applied<Project>> {
        let mut state = self.state.lock();

        let (kind, id) = resolve::resolve(&self.index, handle)?;
        if kind != EntityKind::Project {
            return Err(CoreError::NotFound {
                handle: handle.to_string(),
            });
        }
        let before = self.load_project(&id)?;
        let mut project = before.clone();

        if let Some(title) = patch.title {
            project.title = title;
        }
        if let Some(tags) = patch.tags {
            project.tags = tags;
        }
        if let Some(status) = patch.status {
            project.status = status;
        }
        if let Some(body) = patch.body {
            project.body = body;
        }
        project.updated = Utc::now();

        let warning = self.commit(
            &mut state,
            Some(&Entity::Project(before)),
            &Entity::Project(project.clone()),
            Action::Update,
            json!({}),
        )?;
        Ok(Applied {
            value: project,
            warning,
        })
    }

    pub fn archive_project(&self, handle: &str) -> Result<Applied<Project>> {
        self.update_project(
            handle,
            ProjectPatch {
                status: Some(ProjectStatus::Archived),
                ..ProjectPatch::default()
            },
        )
    }

    /// Retitle a task and re-derive its slug; the file moves with the slug.
    pub fn rename_title(&self, handle: &str, new_title: &str) -> Result<Applied<Task>> {
        let mut state = self.state.lock();

        let id = resolve::resolve_task(&self.index, handle)?;
        let before = self.load_task(&id)?;
        let mut task = before.clone();
        task.title = new_title.to_string();
        task.slug = slug_or_untitled(new_title);
        task.updated = Utc::now();

        let warning = self.commit(
            &mut state,
            Some(&Entity::Task(before)),
            &Entity::Task(task.clone()),
            Action::Update,
            json!({ "fields": ["title", "slug"] }),
        )?;
        Ok(Applied {
            value: task,
            warning,
        })
    }

    pub fn set_due(&self, handle: &str, due: Option<NaiveDate>) -> Result<Applied<Task>> {
        self.update_task(
            handle,
            TaskPatch {
                due: Some(due),
                ..TaskPatch::default()
            },
        )
    }

    pub fn set_tags(&self, handle: &str, tags: Vec<String>) -> Result<Applied<Task>> {
        self.update_task(
            handle,
            TaskPatch {
                tags: Some(tags),
                ..TaskPatch::default()
            },
        )
    }

    /* ----- status ----- */

    pub fn set_status(
        &self,
        handle: &str,
        status: Status,
        policy: Option<CompletionPolicy>,
    ) -> Result<Applied<Task>> {
        let mut state = self.state.lock();
        self.set_status_locked(&mut state, handle, status, policy)
    }

    fn set_status_locked(
        &self,
        state: &mut MutationState,
        handle: &str,
        status: Status,
        policy: Option<CompletionPolicy>,
    ) -> Result<Applied<Task>> {
        let id = resolve::resolve_task(&self.index, handle)?;
        let row = self.index.task(&id)?.ok_or_else(|| CoreError::NotFound {
            handle: handle.to_string(),
        })?;

        // Completing a parent with open children is gated before anything
        // is written.
        let cascade = if status == Status::Done {
            hierarchy::guard_completion(
                &self.index,
                &row,
                policy.unwrap_or(self.config.completion_policy),
            )?
        } else {
            Vec::new()
        };

        let mut warning = self.write_status(state, &id, status)?.warning;
        for descendant in &cascade {
            let applied = self.write_status(state, descendant, Status::Done)?;
            warning = warning.or(applied.warning);
        }

        let task = self.load_task(&id)?;
        Ok(Applied {
            value: task,
            warning,
        })
    }

    fn write_status(
        &self,
        state: &mut MutationState,
        id: &EntityId,
        status: Status,
    ) -> Result<Applied<Task>> {
        let before = self.load_task(id)?;
        let mut task = before.clone();
        task.status = status;
        task.done_at = match status {
            Status::Done => Some(Utc::now()),
            _ => None,
        };
        task.updated = Utc::now();

        let warning = self.commit(
            state,
            Some(&Entity::Task(before)),
            &Entity::Task(task.clone()),
            Action::SetStatus,
            json!({ "status": status.as_str() }),
        )?;
        Ok(Applied {
            value: task,
            warning,
        })
    }

    /// Step the status forward (`direction >= 0`) or backward through the
    /// todo → doing → done cycle.
    pub fn cycle_status(&self, handle: &str, direction: i8) -> Result<Applied<Task>> {
        let current = self.get_task(handle)?.status;
        let next = if direction >= 0 {
            current.next()
        } else {
            current.prev()
        };
        self.set_status(handle, next, None)
    }

    /* ----- hierarchy ----- */

    pub fn reparent(
        &self,
        handle: &str,
        new_parent: Option<&str>,
        reassign_project: bool,
    ) -> Result<Applied<Task>> {
        let mut state = self.state.lock();
        self.reparent_locked(&mut state, handle, new_parent, reassign_project)
    }

    fn reparent_locked(
        &self,
        state: &mut MutationState,
        handle: &str,
        new_parent: Option<&str>,
        reassign_project: bool,
    ) -> Result<Applied<Task>> {
        let id = resolve::resolve_task(&self.index, handle)?;
        let row = self.index.task(&id)?.ok_or_else(|| CoreError::NotFound {
            handle: handle.to_string(),
        })?;

        let parent_id = match new_parent {
            Some(parent_handle) => Some(resolve::resolve_task(&self.index, parent_handle)?),
            None => None,
        };

        let target_project =
            hierarchy::validate_reparent(&self.index, &row, parent_id.as_ref(), reassign_project)?;

        let before = self.load_task(&id)?;
        let mut task = before.clone();
        let project_changed = task.project != target_project;
        task.parent = parent_id.clone();
        task.project = target_project.clone();
        task.sort_order =
            hierarchy::append_order(&self.index, &target_project, parent_id.as_ref())?;
        task.updated = Utc::now();

        let mut warning = self.commit(
            state,
            Some(&Entity::Task(before)),
            &Entity::Task(task.clone()),
            Action::Reparent,
            json!({ "parent": parent_id.as_ref().map(|p| p.to_string()) }),
        )?;

        // A cross-project move carries the whole subtree: a child may never
        // live in a different project than its parent.
        if project_changed {
            for descendant in self.index.descendant_ids(&id)? {
                let before = self.load_task(&descendant)?;
                let mut moved = before.clone();
                moved.project = target_project.clone();
                moved.updated = Utc::now();
                let w = self.commit(
                    state,
                    Some(&Entity::Task(before)),
                    &Entity::Task(moved),
                    Action::Update,
                    json!({ "fields": ["project"] }),
                )?;
                warning = warning.or(w);
            }
        }

        Ok(Applied {
            value: task,
            warning,
        })
    }

    /// Clear the parent and append to the project's top-level siblings.
    pub fn promote(&self, handle: &str) -> Result<Applied<Task>> {
        self.reparent(handle, None, false)
    }

    pub fn reorder(&self, handle: &str, position: Position) -> Result<Applied<Task>> {
        let mut state = self.state.lock();
        self.reorder_locked(&mut state, handle, position)
    }

    fn reorder_locked(
        &self,
        state: &mut MutationState,
        handle: &str,
        position: Position,
    ) -> Result<Applied<Task>> {
        let id = resolve::resolve_task(&self.index, handle)?;
        let row = self.index.task(&id)?.ok_or_else(|| CoreError::NotFound {
            handle: handle.to_string(),
        })?;

        let placement = match position {
            Position::First => Placement::First,
            Position::Last => Placement::Last,
            Position::Before(reference) => {
                Placement::Before(resolve::resolve_task(&self.index, &reference)?)
            }
            Position::After(reference) => {
                Placement::After(resolve::resolve_task(&self.index, &reference)?)
            }
        };

        let outcome = hierarchy::place(
            &self.index,
            &self.config,
            &row.project_id,
            row.parent_id.as_ref(),
            &id,
            &placement,
        )?;

        let before = self.load_task(&id)?;
        let mut task = before.clone();
        task.sort_order = outcome.sort_order;
        task.updated = Utc::now();

        let mut warning = self.commit(
            state,
            Some(&Entity::Task(before)),
            &Entity::Task(task.clone()),
            Action::Reorder,
            json!({ "sort": outcome.sort_order }),
        )?;

        for (sibling_id, sort_order) in outcome.renumber {
            let before = self.load_task(&sibling_id)?;
            let mut sibling = before.clone();
            sibling.sort_order = sort_order;
            let w = self.commit(
                state,
                Some(&Entity::Task(before)),
                &Entity::Task(sibling),
                Action::Reorder,
                json!({ "sort": sort_order }),
            )?;
            warning = warning.or(w);
        }

        Ok(Applied {
            value: task,
            warning,
        })
    }

    /* ----- delete ----- */

    pub fn delete(&self, handle: &str, policy: CascadePolicy) -> Result<Applied<Vec<EntityId>>> {
        let mut state = self.state.lock();
        self.delete_locked(&mut state, handle, policy)
    }

    fn delete_locked(
        &self,
        state: &mut MutationState,
        handle: &str,
        policy: CascadePolicy,
    ) -> Result<Applied<Vec<EntityId>>> {
        let id = resolve::resolve_task(&self.index, handle)?;
        let row = self.index.task(&id)?.ok_or_else(|| CoreError::NotFound {
            handle: handle.to_string(),
        })?;

        let plan = hierarchy::delete_plan(&self.index, &row, policy)?;

        let mut warning = None;
        for child_id in &plan.reassign {
            let before = self.load_task(child_id)?;
            let mut child = before.clone();
            child.parent = row.parent_id.clone();
            child.updated = Utc::now();
            let w = self.commit(
                state,
                Some(&Entity::Task(before)),
                &Entity::Task(child),
                Action::Reparent,
                json!({ "parent": row.parent_id.as_ref().map(|p| p.to_string()) }),
            )?;
            warning = warning.or(w);
        }

        for victim in &plan.delete {
            let entity = Entity::Task(self.load_task(victim)?);
            let w = self.remove_entity(state, &entity)?;
            warning = warning.or(w);
        }

        Ok(Applied {
            value: plan.delete,
            warning,
        })
    }

    pub fn delete_project(
        &self,
        handle: &str,
        cascade: ProjectCascade,
    ) -> Result<Applied<Vec<EntityId>>> {
        let mut state = self.state.lock();

        let (kind, id) = resolve::resolve(&self.index, handle)?;
        if kind != EntityKind::Project {
            return Err(CoreError::NotFound {
                handle: handle.to_string(),
            });
        }

        let task_count = self.index.task_count_in_project(&id)?;
        let mut deleted = Vec::new();
        let mut warning = None;

        match cascade {
            ProjectCascade::Refuse if task_count > 0 => {
                return Err(CoreError::HasChildren {
                    id: id.to_string(),
                    count: task_count,
                });
            }
            ProjectCascade::Refuse => {}
            ProjectCascade::DeleteTasks => {
                for row in self.index.tasks_in_project(&id)? {
                    let entity = Entity::Task(self.load_task(&row.id)?);
                    let w = self.remove_entity(&mut state, &entity)?;
                    warning = warning.or(w);
                    deleted.push(row.id);
                }
            }
            ProjectCascade::MigrateTo(target_handle) => {
                let (kind, target) = resolve::resolve(&self.index, &target_handle)?;
                if kind != EntityKind::Project || target == id {
                    return Err(CoreError::NotFound {
                        handle: target_handle.clone(),
                    });
                }
                for row in self.index.tasks_in_project(&id)? {
                    let before = self.load_task(&row.id)?;
                    let mut moved = before.clone();
                    moved.project = target.clone();
                    moved.updated = Utc::now();
                    let w = self.commit(
                        &mut state,
                        Some(&Entity::Task(before)),
                        &Entity::Task(moved),
                        Action::Update,
                        json!({ "fields": ["project"] }),
                    )?;
                    warning = warning.or(w);
                }
            }
        }

        let project = Entity::Project(self.load_project(&id)?);
        let w = self.remove_entity(&mut state, &project)?;
        warning = warning.or(w);
        deleted.push(id);

        Ok(Applied {
            value: deleted,
            warning,
        })
    }

    /* ----- reconciliation ----- */

    /// Apply one out-of-band vault change to the index. Called by the
    /// watcher thread, and directly by anything that already knows a file
    /// changed.
    pub fn reconcile(&self, change: &VaultChange) -> Result<()> {
        let mut state = self.state.lock();
        self.reconcile_locked(&mut state, change)
    }

    /// Generation snapshot for the watcher's stale check.
    pub(crate) fn generation_of(&self, rel: &str) -> u64 {
        self.state
            .lock()
            .generations
            .get(rel)
            .copied()
            .unwrap_or(0)
    }

    /// Like [`reconcile`], but skips when a foreground write has already
    /// re-indexed the path since the event was observed.
    pub(crate) fn reconcile_if_fresh(&self, change: &VaultChange, observed_gen: u64) -> Result<()> {
        let mut state = self.state.lock();
        let rel = index::rel_path(&self.vault, change.path());
        let current = state.generations.get(&rel).copied().unwrap_or(0);
        if current > observed_gen {
            tracing::debug!("skipping stale change for {rel}");
            return Ok(());
        }
        self.reconcile_locked(&mut state, change)
    }

    fn reconcile_locked(&self, state: &mut MutationState, change: &VaultChange) -> Result<()> {
        let path = change.path();
        if self.vault.classify(path).is_none() {
            return Ok(());
        }
        let rel = index::rel_path(&self.vault, path);

        let upsert = match change {
            VaultChange::Upserted { .. } => path.exists(),
            VaultChange::Removed { .. } => false,
        };

        if upsert {
            match self.vault.read(path) {
                Ok(entity) => {
                    tracing::debug!("reconciling {rel}");
                    self.mirror(state, &entity, &rel).map(|_| ())
                }
                Err(
                    err @ (CoreError::MalformedRecord { .. } | CoreError::SchemaViolation { .. }),
                ) => {
                    // The file is the user's; leave it alone and keep
                    // whatever the index last knew.
                    tracing::warn!("ignoring unreadable vault file: {err}");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else {
            if let Some((_, id)) = self.index.entity_at_path(&rel)? {
                tracing::debug!("removing {rel} from index");
                self.index.delete(&id)?;
            }
            Ok(())
        }
    }

    /// Retry pending index writes left behind by `IndexDesync` outcomes.
    fn heal(&self) {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        for item in pending {
            match self.index.upsert(&item.entity, &item.rel_path) {
                Ok(()) => {
                    tracing::info!("re-synced {} into the index", item.entity.id());
                }
                Err(err) => {
                    tracing::warn!("re-sync of {} still failing: {err}", item.entity.id());
                    state.pending.push(item);
                }
            }
        }
    }

    /* ----- batches ----- */

    /// Start a multi-step batch. Queued operations apply back-to-back under
    /// one hold of the mutation lock on `commit`; `rollback` (or drop)
    /// discards them.
    pub fn begin(&self) -> Batch<'_> {
        Batch {
            store: self,
            queued: Vec::new(),
        }
    }

    /* ----- write plumbing ----- */

    /// Vault write, then index mirror, as one unit. Returns the desync
    /// warning, if any. `StorageIo` from the vault aborts before the index
    /// is touched.
    fn commit(
        &self,
        state: &mut MutationState,
        before: Option<&Entity>,
        entity: &Entity,
        action: Action,
        payload: serde_json::Value,
    ) -> Result<Option<CoreError>> {
        let path = self.vault.write(entity, before)?;
        let rel = index::rel_path(&self.vault, &path);
        *state.generations.entry(rel.clone()).or_insert(0) += 1;

        self.record_event(entity, action, payload);
        Ok(self.mirror(state, entity, &rel)?)
    }

    fn remove_entity(
        &self,
        state: &mut MutationState,
        entity: &Entity,
    ) -> Result<Option<CoreError>> {
        self.vault.remove(entity)?;
        let rel = index::rel_path(&self.vault, &self.vault.resolve_path(entity));
        *state.generations.entry(rel).or_insert(0) += 1;

        self.record_event(entity, Action::Delete, json!({}));
        match self.index.delete(entity.id()) {
            Ok(()) => Ok(None),
            Err(err) if err.is_index_corruption() => {
                tracing::warn!("index unusable during delete ({err}); rebuilding");
                self.index.rebuild(&self.vault, None)?;
                Ok(None)
            }
            Err(err) => Ok(Some(CoreError::IndexDesync {
                id: entity.id().to_string(),
                reason: err.to_string(),
            })),
        }
    }

    /// Index-side half of a commit. Corruption triggers a rebuild; any
    /// other failure queues the entity for lazy re-sync and surfaces a
    /// warning.
    fn mirror(
        &self,
        state: &mut MutationState,
        entity: &Entity,
        rel: &str,
    ) -> Result<Option<CoreError>> {
        match self.index.upsert(entity, rel) {
            Ok(()) => Ok(None),
            Err(err) if err.is_index_corruption() => {
                tracing::warn!("index unusable ({err}); rebuilding from vault");
                self.index.rebuild(&self.vault, None)?;
                Ok(None)
            }
            Err(err) => {
                let warning = CoreError::IndexDesync {
                    id: entity.id().to_string(),
                    reason: err.to_string(),
                };
                tracing::warn!("{warning}");
                state.pending.push(PendingSync {
                    entity: entity.clone(),
                    rel_path: rel.to_string(),
                });
                Ok(Some(warning))
            }
        }
    }

    fn record_event(&self, entity: &Entity, action: Action, payload: serde_json::Value) {
        let record = EventRecord {
            entity: entity.kind(),
            id: entity.id().clone(),
            action,
            payload,
            timestamp: Utc::now(),
            actor: "core".into(),
        };
        // The audit trail is advisory in v1; a write failure must not fail
        // the mutation whose file is already durable.
        if let Err(err) = self.events.append(&record) {
            tracing::warn!("event log append failed: {err}");
        }
    }

    fn load_task(&self, id: &EntityId) -> Result<Task> {
        let row = self.index.task(id)?.ok_or_else(|| CoreError::NotFound {
            handle: id.to_string(),
        })?;
        match self.vault.read(&self.vault.root().join(&row.path))? {
            Entity::Task(task) => Ok(task),
            Entity::Project(_) => Err(CoreError::SchemaViolation {
                path: Some(Path::new(&row.path).to_path_buf()),
                reason: "expected a task file".into(),
            }),
        }
    }

    fn load_project(&self, id: &EntityId) -> Result<Project> {
        let row = self.index.project(id)?.ok_or_else(|| CoreError::NotFound {
            handle: id.to_string(),
        })?;
        match self.vault.read(&self.vault.root().join(&row.path))? {
            Entity::Project(project) => Ok(project),
            Entity::Task(_) => Err(CoreError::SchemaViolation {
                path: Some(Path::new(&row.path).to_path_buf()),
                reason: "expected a project file".into(),
            }),
        }
    }
}

/// One queued batch operation.
#[derive(Debug, Clone)]
enum BatchOp {
    CreateProject(NewProject),
    CreateTask(NewTask),
    UpdateTask {
        handle: String,
        patch: TaskPatch,
    },
    SetStatus {
        handle: String,
        status: Status,
        policy: Option<CompletionPolicy>,
    },
    Reparent {
        handle: String,
        parent: Option<String>,
        reassign_project: bool,
    },
    Reorder {
        handle: String,
        position: Position,
    },
    Delete {
        handle: String,
        policy: CascadePolicy,
    },
}

/// A multi-step batch with the same atomic-apply semantics as single
/// operations: everything runs back-to-back under one hold of the mutation
/// lock, and validation errors stop the run at the failing step.
pub struct Batch<'a> {
    store: &'a Store,
    queued: Vec<BatchOp>,
}

impl Batch<'_> {
    pub fn create_project(&mut self, new: NewProject) -> &mut Self {
        self.queued.push(BatchOp::CreateProject(new));
        self
    }

    pub fn create_task(&mut self, new: NewTask) -> &mut Self {
        self.queued.push(BatchOp::CreateTask(new));
        self
    }

    pub fn update_task(&mut self, handle: impl Into<String>, patch: TaskPatch) -> &mut Self {
        self.queued.push(BatchOp::UpdateTask {
            handle: handle.into(),
            patch,
        });
        self
    }

    pub fn set_status(
        &mut self,
        handle: impl Into<String>,
        status: Status,
        policy: Option<CompletionPolicy>,
    ) -> &mut Self {
        self.queued.push(BatchOp::SetStatus {
            handle: handle.into(),
            status,
            policy,
        });
        self
    }

    pub fn reparent(
        &mut self,
        handle: impl Into<String>,
        parent: Option<String>,
        reassign_project: bool,
    ) -> &mut Self {
        self.queued.push(BatchOp::Reparent {
            handle: handle.into(),
            parent,
            reassign_project,
        });
        self
    }

    pub fn reorder(&mut self, handle: impl Into<String>, position: Position) -> &mut Self {
        self.queued.push(BatchOp::Reorder {
            handle: handle.into(),
            position,
        });
        self
    }

    pub fn delete(&mut self, handle: impl Into<String>, policy: CascadePolicy) -> &mut Self {
        self.queued.push(BatchOp::Delete {
            handle: handle.into(),
            policy,
        });
        self
    }

    /// Apply every queued operation. Returns the affected ids in apply
    /// order. The first failing step stops the batch; files already written
    /// stay (the vault is never rolled back).
    pub fn commit(self) -> Result<Applied<Vec<EntityId>>> {
        let mut state = self.store.state.lock();
        let mut affected = Vec::new();
        let mut warning = None;

        for op in &self.queued {
            let w = match op {
                BatchOp::CreateProject(new) => {
                    let applied = self
                        .store
                        .create_project_locked(&mut state, new.clone())?;
                    affected.push(applied.value.id);
                    applied.warning
                }
                BatchOp::CreateTask(new) => {
                    let applied = self.store.create_task_locked(&mut state, new.clone())?;
                    affected.push(applied.value.id);
                    applied.warning
                }
                BatchOp::UpdateTask { handle, patch } => {
                    let applied =
                        self.store
                            .update_task_locked(&mut state, handle, patch.clone())?;
                    affected.push(applied.value.id);
                    applied.warning
                }
                BatchOp::SetStatus {
                    handle,
                    status,
                    policy,
                } => {
                    let applied =
                        self.store
                            .set_status_locked(&mut state, handle, *status, *policy)?;
                    affected.push(applied.value.id);
                    applied.warning
                }
                BatchOp::Reparent {
                    handle,
                    parent,
                    reassign_project,
                } => {
                    let applied = self.store.reparent_locked(
                        &mut state,
                        handle,
                        parent.as_deref(),
                        *reassign_project,
                    )?;
                    affected.push(applied.value.id);
                    applied.warning
                }
                BatchOp::Reorder { handle, position } => {
                    let applied =
                        self.store
                            .reorder_locked(&mut state, handle, position.clone())?;
                    affected.push(applied.value.id);
                    applied.warning
                }
                BatchOp::Delete { handle, policy } => {
                    let applied = self.store.delete_locked(&mut state, handle, *policy)?;
                    affected.extend(applied.value);
                    applied.warning
                }
            };
            warning = warning.or(w);
        }

        Ok(Applied {
            value: affected,
            warning,
        })
    }

    /// Discard every queued operation.
    pub fn rollback(self) {}
}

// Tests for the full write path live in tests/engine_tests.rs; these cover
// the pieces that are awkward to reach from the public surface.
#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Config::with_vault(dir.path().join("vault"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_project_dedupes_slug() {
        let (_dir, store) = open_store();
        let a = store.create_project(NewProject {
            title: "Inbox".into(),
            ..NewProject::default()
        });
        let b = store.create_project(NewProject {
            title: "Inbox".into(),
            ..NewProject::default()
        });
        assert_eq!(a.unwrap().value.slug, "inbox");
        assert_eq!(b.unwrap().value.slug, "inbox-2");
    }

    #[test]
    fn test_create_task_requires_live_project() {
        let (_dir, store) = open_store();
        let err = store.create_task(NewTask::new("Orphan", "no-such-project"));
        assert!(matches!(err, Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn test_cross_project_parent_rejected_at_create() {
        let (_dir, store) = open_store();
        store
            .create_project(NewProject {
                title: "Home".into(),
                ..NewProject::default()
            })
            .unwrap();
        store
            .create_project(NewProject {
                title: "Work".into(),
                ..NewProject::default()
            })
            .unwrap();
        let parent = store.create_task(NewTask::new("Parent", "home")).unwrap();

        let mut new = NewTask::new("Child", "work");
        new.parent = Some(parent.value.id.to_string());
        assert!(matches!(
            store.create_task(new),
            Err(CoreError::ProjectMismatch { .. })
        ));
    }

    #[test]
    fn test_generation_bumps_on_foreground_write() {
        let (_dir, store) = open_store();
        store
            .create_project(NewProject {
                title: "Home".into(),
                ..NewProject::default()
            })
            .unwrap();
        let task = store.create_task(NewTask::new("Tick", "home")).unwrap();
        let rel = index::rel_path(
            &store.vault,
            &store.vault.resolve_path(&Entity::Task(task.value.clone())),
        );
        assert_eq!(store.generation_of(&rel), 1);

        store.set_status(&task.value.id.to_string(), Status::Doing, None).unwrap();
        assert_eq!(store.generation_of(&rel), 2);

        // A stale observation is skipped without error.
        store
            .reconcile_if_fresh(
                &VaultChange::Upserted {
                    path: store.vault.root().join(&rel),
                },
                1,
            )
            .unwrap();
    }
}
