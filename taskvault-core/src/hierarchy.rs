//! Parent/child linkage rules: cycle prevention, ordering, roll-up.
//!
//! Parent references are plain id values validated against the mirrored
//! columns on every edge change. Nothing here touches the vault; callers
//! apply the returned plans through the consistency manager.

use crate::config::{CompletionPolicy, Config, OrderingStrategy};
use crate::error::{CoreError, Result};
use crate::index::{IndexStore, TaskRow};
use taskvault_types::EntityId;

/// Where to place a task within its sibling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    First,
    Last,
    Before(EntityId),
    After(EntityId),
}

/// A computed sibling position, plus any renumbering of the rest of the run
/// that keeping the gap invariant required.
#[derive(Debug, Clone, Default)]
pub struct OrderOutcome {
    pub sort_order: f64,
    /// Sibling ids (never the moved task) that must be rewritten with fresh
    /// positions.
    pub renumber: Vec<(EntityId, f64)>,
}

/// What to do with children when deleting a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePolicy {
    Refuse,
    DeleteChildren,
    ReassignToGrandparent,
}

/// Deletion order and reassignments for a delete request.
#[derive(Debug, Clone, Default)]
pub struct DeletePlan {
    /// Ids to delete, leaves first so no file ever references a gone parent.
    pub delete: Vec<EntityId>,
    /// Children to move to the deleted task's own parent.
    pub reassign: Vec<EntityId>,
}

/// Validate a parent change. Returns the project the task must carry after
/// the move (differs from its current project only when `reassign_project`
/// allowed a cross-project move).
pub fn validate_reparent(
    index: &IndexStore,
    task: &TaskRow,
    new_parent: Option<&EntityId>,
    reassign_project: bool,
) -> Result<EntityId> {
    let Some(parent_id) = new_parent else {
        return Ok(task.project_id.clone());
    };

    if parent_id == &task.id {
        return Err(CoreError::CycleDetected {
            task: task.id.to_string(),
            parent: parent_id.to_string(),
        });
    }

    let parent = index.task(parent_id)?.ok_or_else(|| CoreError::NotFound {
        handle: parent_id.to_string(),
    })?;

    if index.descendant_ids(&task.id)?.contains(parent_id) {
        return Err(CoreError::CycleDetected {
            task: task.id.to_string(),
            parent: parent_id.to_string(),
        });
    }

    if parent.project_id != task.project_id && !reassign_project {
        return Err(CoreError::ProjectMismatch {
            task: task.id.to_string(),
            parent: parent_id.to_string(),
        });
    }

    Ok(parent.project_id)
}

/// Position for appending to the end of a sibling run.
pub fn append_order(
    index: &IndexStore,
    project: &EntityId,
    parent: Option<&EntityId>,
) -> Result<f64> {
    let siblings = index.siblings(project, parent)?;
    Ok(next_after(siblings.last().map(|t| t.sort_order)))
}

fn next_after(last: Option<f64>) -> f64 {
    match last {
        Some(v) => v + 1.0,
        None => 1.0,
    }
}

/// Compute the sort position for `task_id` placed within the run owned by
/// (`project`, `parent`). Fractional midpoints by default; the whole run is
/// renumbered when the midpoint gap underflows the configured minimum (or
/// always, under the renumber strategy).
pub fn place(
    index: &IndexStore,
    config: &Config,
    project: &EntityId,
    parent: Option<&EntityId>,
    task_id: &EntityId,
    placement: &Placement,
) -> Result<OrderOutcome> {
    let siblings: Vec<TaskRow> = index
        .siblings(project, parent)?
        .into_iter()
        .filter(|t| &t.id != task_id)
        .collect();

    let slot = match placement {
        Placement::First => 0,
        Placement::Last => siblings.len(),
        Placement::Before(reference) => position_of(&siblings, reference)?,
        Placement::After(reference) => position_of(&siblings, reference)? + 1,
    };

    let below = slot.checked_sub(1).and_then(|i| siblings.get(i));
    let above = siblings.get(slot);

    let fractional = match (below, above) {
        (None, None) => Some(1.0),
        (Some(b), None) => Some(b.sort_order + 1.0),
        (None, Some(a)) => Some(a.sort_order / 2.0),
        (Some(b), Some(a)) => {
            let mid = (b.sort_order + a.sort_order) / 2.0;
            let gap = (a.sort_order - b.sort_order) / 2.0;
            (gap >= config.min_order_gap).then_some(mid)
        }
    };

    if config.ordering == OrderingStrategy::Fractional {
        // A midpoint at or below zero has run out of room under the first
        // sibling, which renumbering fixes like any collapsed gap.
        if let Some(sort_order) = fractional.filter(|v| *v > 0.0) {
            return Ok(OrderOutcome {
                sort_order,
                renumber: Vec::new(),
            });
        }
    }

    // Renumber the run 1.0, 2.0, ... with the moved task in its slot.
    let mut renumber = Vec::new();
    let mut sort_order = 0.0;
    let mut next = 1.0;
    for (i, sibling) in siblings.iter().enumerate() {
        if i == slot {
            sort_order = next;
            next += 1.0;
        }
        renumber.push((sibling.id.clone(), next));
        next += 1.0;
    }
    if slot == siblings.len() {
        sort_order = next;
    }

    Ok(OrderOutcome { sort_order, renumber })
}

fn position_of(siblings: &[TaskRow], reference: &EntityId) -> Result<usize> {
    siblings
        .iter()
        .position(|t| &t.id == reference)
        .ok_or_else(|| CoreError::NotFound {
            handle: reference.to_string(),
        })
}

/// Done-children over total-children, `None` for a leaf. Computed on read,
/// never persisted.
pub fn completion_ratio(index: &IndexStore, id: &EntityId) -> Result<Option<f64>> {
    let (done, total) = index.child_stats(id)?;
    if total == 0 {
        return Ok(None);
    }
    Ok(Some(done as f64 / total as f64))
}

/// A task's due date for query and sort purposes: its own, or the latest
/// among its direct children.
pub fn effective_due(
    index: &IndexStore,
    task: &TaskRow,
) -> Result<Option<chrono::NaiveDate>> {
    if task.due.is_some() {
        return Ok(task.due);
    }
    let children = index.children(&task.id)?;
    Ok(children.iter().filter_map(|c| c.due).max())
}

/// Gate completing a task that still has open children. Returns the
/// descendant ids that must be completed alongside it (empty unless the
/// policy cascades).
pub fn guard_completion(
    index: &IndexStore,
    task: &TaskRow,
    policy: CompletionPolicy,
) -> Result<Vec<EntityId>> {
    let open: Vec<EntityId> = open_descendants(index, &task.id)?;
    if open.is_empty() {
        return Ok(Vec::new());
    }
    match policy {
        CompletionPolicy::Block => Err(CoreError::HasChildren {
            id: task.id.to_string(),
            count: open.len(),
        }),
        CompletionPolicy::Cascade => Ok(open),
        CompletionPolicy::Force => Ok(Vec::new()),
    }
}

fn open_descendants(index: &IndexStore, id: &EntityId) -> Result<Vec<EntityId>> {
    let mut open = Vec::new();
    for descendant in index.descendant_ids(id)? {
        if let Some(row) = index.task(&descendant)? {
            if !row.status.is_terminal() {
                open.push(descendant);
            }
        }
    }
    Ok(open)
}

/// Work out which tasks a delete request removes or moves.
pub fn delete_plan(
    index: &IndexStore,
    task: &TaskRow,
    policy: CascadePolicy,
) -> Result<DeletePlan> {
    let children = index.children(&task.id)?;
    if children.is_empty() {
        return Ok(DeletePlan {
            delete: vec![task.id.clone()],
            reassign: Vec::new(),
        });
    }

    match policy {
        CascadePolicy::Refuse => Err(CoreError::HasChildren {
            id: task.id.to_string(),
            count: children.len(),
        }),
        CascadePolicy::DeleteChildren => {
            // Leaves first, the task itself last.
            let mut delete = index.descendant_ids(&task.id)?;
            delete.reverse();
            delete.push(task.id.clone());
            Ok(DeletePlan {
                delete,
                reassign: Vec::new(),
            })
        }
        CascadePolicy::ReassignToGrandparent => Ok(DeletePlan {
            delete: vec![task.id.clone()],
            reassign: children.into_iter().map(|c| c.id).collect(),
        }),
    }
}
