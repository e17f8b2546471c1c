//! Handle resolution: user-supplied text to a canonical entity id.
//!
//! Probes the index in a fixed order (exact id, exact slug, `date/slug`,
//! id prefix) and stops at the first stage that matches anything. A stage
//! matching more than one live entity is ambiguous, never a guess.

use crate::error::{CoreError, Result};
use crate::index::IndexStore;
use taskvault_types::{EntityId, EntityKind};

/// Resolve a handle to a single live entity.
pub fn resolve(index: &IndexStore, handle: &str) -> Result<(EntityKind, EntityId)> {
    let handle = handle.trim();
    if handle.is_empty() {
        return Err(CoreError::NotFound {
            handle: handle.to_string(),
        });
    }

    if EntityId::parse(handle).is_some() {
        if let Some(hit) = single(index.ids_matching_exact(handle)?, handle)? {
            return Ok(hit);
        }
    }

    if let Some(hit) = single(index.ids_matching_slug(handle)?, handle)? {
        return Ok(hit);
    }

    if let Some((date, slug)) = split_date_slug(handle) {
        if let Some(hit) = single(index.ids_matching_date_slug(date, slug)?, handle)? {
            return Ok(hit);
        }
    }

    if let Some(hit) = single(index.ids_matching_prefix(handle)?, handle)? {
        return Ok(hit);
    }

    Err(CoreError::NotFound {
        handle: handle.to_string(),
    })
}

/// Resolve and insist on a task.
pub fn resolve_task(index: &IndexStore, handle: &str) -> Result<EntityId> {
    match resolve(index, handle)? {
        (EntityKind::Task, id) => Ok(id),
        (EntityKind::Project, _) => Err(CoreError::NotFound {
            handle: handle.to_string(),
        }),
    }
}

fn single(
    matches: Vec<(EntityKind, EntityId)>,
    handle: &str,
) -> Result<Option<(EntityKind, EntityId)>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.into_iter().next()),
        _ => Err(CoreError::AmbiguousHandle {
            handle: handle.to_string(),
            candidates: matches.iter().map(|(_, id)| id.to_string()).collect(),
        }),
    }
}

/// `YYYY-MM-DD/slug` composites.
fn split_date_slug(handle: &str) -> Option<(&str, &str)> {
    let (date, slug) = handle.split_once('/')?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    if slug.is_empty() {
        return None;
    }
    Some((date, slug))
}
