//! Entity model structs for projects and tasks.

use crate::error::{CoreError, Result};
use crate::frontmatter::{FieldMap, FieldValue};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use taskvault_types::EntityId;

/// Task workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Todo,
    Doing,
    Done,
    Cancelled,
}

impl Status {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Status::Todo),
            "doing" | "in-progress" | "in_progress" => Some(Status::Doing),
            "done" => Some(Status::Done),
            "cancelled" | "canceled" => Some(Status::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::Doing => "doing",
            Status::Done => "done",
            Status::Cancelled => "cancelled",
        }
    }

    /// Forward step in the todo → doing → done cycle. Cancelled tasks stay
    /// out of the cycle until explicitly reopened.
    pub fn next(&self) -> Self {
        match self {
            Status::Todo => Status::Doing,
            Status::Doing => Status::Done,
            Status::Done => Status::Todo,
            Status::Cancelled => Status::Todo,
        }
    }

    pub fn prev(&self) -> Self {
        match self {
            Status::Todo => Status::Done,
            Status::Doing => Status::Todo,
            Status::Done => Status::Doing,
            Status::Cancelled => Status::Todo,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Cancelled)
    }
}

/// Task priority, ordered for sorting (urgent highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    None,
    Low,
    Med,
    High,
    Urgent,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Priority::None),
            "low" => Some(Priority::Low),
            "med" | "medium" => Some(Priority::Med),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::None => "none",
            Priority::Low => "low",
            Priority::Med => "med",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Numeric rank mirrored into the index for range queries.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::None => 0,
            Priority::Low => 1,
            Priority::Med => 2,
            Priority::High => 3,
            Priority::Urgent => 4,
        }
    }
}

/// Project lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Archived,
}

impl ProjectStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProjectStatus::Active),
            "archived" => Some(ProjectStatus::Archived),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Archived => "archived",
        }
    }
}

/// Recurrence rule stored as a one-level nested mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    /// Interval word: `day`, `week`, `month`, ...
    pub every: String,

    /// Optional anchor within the interval (`monday`, `15`, ...).
    pub day: Option<String>,
}

/// A project: a named bucket of tasks backed by one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: EntityId,
    pub slug: String,
    pub title: String,
    pub status: ProjectStatus,
    pub tags: Vec<String>,
    pub sort_order: f64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    /// Markdown description (the file body).
    pub body: String,
}

/// A task, optionally parented under another task in the same project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub slug: String,
    pub project: EntityId,
    pub parent: Option<EntityId>,
    pub title: String,
    pub status: Status,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub due: Option<NaiveDate>,
    pub start: Option<NaiveDate>,
    pub done_at: Option<DateTime<Utc>>,
    pub recur: Option<Recurrence>,
    /// Estimated effort, minutes.
    pub estimate_min: Option<u32>,
    /// Recorded effort, minutes.
    pub actual_min: Option<u32>,
    pub assignee: Option<String>,
    pub sort_order: f64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    /// Markdown notes (the file body).
    pub body: String,
}

/// Either entity, as read back from the vault.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Project(Project),
    Task(Task),
}

impl Entity {
    pub fn id(&self) -> &EntityId {
        match self {
            Entity::Project(p) => &p.id,
            Entity::Task(t) => &t.id,
        }
    }

    pub fn slug(&self) -> &str {
        match self {
            Entity::Project(p) => &p.slug,
            Entity::Task(t) => &t.slug,
        }
    }

    pub fn created(&self) -> DateTime<Utc> {
        match self {
            Entity::Project(p) => p.created,
            Entity::Task(t) => t.created,
        }
    }

    pub fn kind(&self) -> taskvault_types::EntityKind {
        match self {
            Entity::Project(_) => taskvault_types::EntityKind::Project,
            Entity::Task(_) => taskvault_types::EntityKind::Task,
        }
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn violation(reason: impl Into<String>) -> CoreError {
    CoreError::SchemaViolation {
        path: None,
        reason: reason.into(),
    }
}

fn required<'a>(map: &'a FieldMap, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(FieldValue::as_scalar)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| violation(format!("missing required field '{key}'")))
}

fn optional(map: &FieldMap, key: &str) -> Option<String> {
    map.get(key)
        .and_then(FieldValue::as_scalar)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_id(raw: &str, key: &str) -> Result<EntityId> {
    EntityId::parse(raw).ok_or_else(|| violation(format!("'{raw}' is not a valid {key} id")))
}

fn parse_timestamp(raw: &str, key: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| violation(format!("bad timestamp in '{key}': {raw}")))
}

fn parse_date(raw: &str, key: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| violation(format!("bad date in '{key}': {raw}")))
}

fn parse_minutes(raw: &str, key: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|_| violation(format!("bad minute count in '{key}': {raw}")))
}

fn parse_sort(map: &FieldMap) -> Result<f64> {
    match optional(map, "sort") {
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|_| violation(format!("bad sort position: {raw}"))),
        None => Ok(0.0),
    }
}

/// Creation/update stamps are optional in hand-written files; the ULID
/// carries the creation instant, so fall back to it.
fn stamp_or_id_time(
    map: &FieldMap,
    key: &str,
    id: &EntityId,
    fallback: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    match optional(map, key) {
        Some(raw) => parse_timestamp(&raw, key),
        None => Ok(fallback.unwrap_or_else(|| {
            chrono::TimeZone::timestamp_millis_opt(&Utc, id.timestamp_ms() as i64)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        })),
    }
}

impl Project {
    /// Build a typed project from a decoded header and body.
    pub fn from_parts(map: &FieldMap, body: &str) -> Result<Self> {
        let id = parse_id(required(map, "id")?, "project")?;
        let status_raw = required(map, "status")?;
        let status = ProjectStatus::parse(status_raw)
            .ok_or_else(|| violation(format!("unknown project status '{status_raw}'")))?;

        let created = stamp_or_id_time(map, "created", &id, None)?;
        Ok(Project {
            slug: required(map, "slug")?.to_string(),
            title: optional(map, "title").unwrap_or_default(),
            status,
            tags: map.get("tags").map(FieldValue::as_items).unwrap_or_default(),
            sort_order: parse_sort(map)?,
            created,
            updated: stamp_or_id_time(map, "updated", &id, Some(created))?,
            id,
            body: body.to_string(),
        })
    }

    /// Project known fields onto a header, leaving unrecognized keys alone.
    pub fn write_to(&self, map: &mut FieldMap) {
        map.set("id", FieldValue::scalar(self.id.as_str()));
        map.set("slug", FieldValue::scalar(&self.slug));
        map.set("title", FieldValue::scalar(&self.title));
        map.set("status", FieldValue::scalar(self.status.as_str()));
        map.set("tags", FieldValue::list(self.tags.iter().cloned()));
        if self.sort_order != 0.0 {
            map.set("sort", FieldValue::scalar(self.sort_order.to_string()));
        }
        map.set("created", FieldValue::scalar(format_timestamp(&self.created)));
        map.set("updated", FieldValue::scalar(format_timestamp(&self.updated)));
    }
}

impl Task {
    /// Build a typed task from a decoded header and body.
    pub fn from_parts(map: &FieldMap, body: &str) -> Result<Self> {
        let id = parse_id(required(map, "id")?, "task")?;
        let project = parse_id(required(map, "project")?, "project")?;
        let status_raw = required(map, "status")?;
        let status = Status::parse(status_raw)
            .ok_or_else(|| violation(format!("unknown status '{status_raw}'")))?;

        let priority = match optional(map, "priority") {
            Some(raw) => Priority::parse(&raw)
                .ok_or_else(|| violation(format!("unknown priority '{raw}'")))?,
            None => Priority::None,
        };

        let parent = match optional(map, "parent") {
            Some(raw) => Some(parse_id(&raw, "parent")?),
            None => None,
        };

        let recur = match map.get("recur").and_then(FieldValue::as_map) {
            Some(pairs) => {
                let every = pairs
                    .iter()
                    .find(|(k, _)| k == "every")
                    .map(|(_, v)| v.trim().to_string())
                    .ok_or_else(|| violation("recur block missing 'every'"))?;
                let day = pairs
                    .iter()
                    .find(|(k, _)| k == "day")
                    .map(|(_, v)| v.trim().to_string());
                Some(Recurrence { every, day })
            }
            None => None,
        };

        let created = stamp_or_id_time(map, "created", &id, None)?;
        Ok(Task {
            slug: required(map, "slug")?.to_string(),
            project,
            parent,
            title: optional(map, "title").unwrap_or_default(),
            status,
            priority,
            tags: map.get("tags").map(FieldValue::as_items).unwrap_or_default(),
            due: optional(map, "due")
                .map(|raw| parse_date(&raw, "due"))
                .transpose()?,
            start: optional(map, "start")
                .map(|raw| parse_date(&raw, "start"))
                .transpose()?,
            done_at: optional(map, "done")
                .map(|raw| parse_timestamp(&raw, "done"))
                .transpose()?,
            recur,
            estimate_min: optional(map, "estimate")
                .map(|raw| parse_minutes(&raw, "estimate"))
                .transpose()?,
            actual_min: optional(map, "actual")
                .map(|raw| parse_minutes(&raw, "actual"))
                .transpose()?,
            assignee: optional(map, "assignee"),
            sort_order: parse_sort(map)?,
            created,
            updated: stamp_or_id_time(map, "updated", &id, Some(created))?,
            id,
            body: body.to_string(),
        })
    }

    /// Project known fields onto a header, leaving unrecognized keys alone.
    /// Optional fields that went back to `None` are dropped from the header.
    pub fn write_to(&self, map: &mut FieldMap) {
        map.set("id", FieldValue::scalar(self.id.as_str()));
        map.set("slug", FieldValue::scalar(&self.slug));
        map.set("title", FieldValue::scalar(&self.title));
        map.set("project", FieldValue::scalar(self.project.as_str()));
        set_or_remove(map, "parent", self.parent.as_ref().map(|p| p.to_string()));
        map.set("status", FieldValue::scalar(self.status.as_str()));
        map.set("priority", FieldValue::scalar(self.priority.as_str()));
        map.set("tags", FieldValue::list(self.tags.iter().cloned()));
        set_or_remove(map, "due", self.due.map(|d| d.to_string()));
        set_or_remove(map, "start", self.start.map(|d| d.to_string()));
        set_or_remove(map, "done", self.done_at.as_ref().map(format_timestamp));
        match &self.recur {
            Some(r) => {
                let mut pairs = vec![("every".to_string(), r.every.clone())];
                if let Some(day) = &r.day {
                    pairs.push(("day".to_string(), day.clone()));
                }
                map.set("recur", FieldValue::Map(pairs));
            }
            None => {
                map.remove("recur");
            }
        }
        set_or_remove(map, "estimate", self.estimate_min.map(|m| m.to_string()));
        set_or_remove(map, "actual", self.actual_min.map(|m| m.to_string()));
        set_or_remove(map, "assignee", self.assignee.clone());
        map.set("sort", FieldValue::scalar(self.sort_order.to_string()));
        map.set("created", FieldValue::scalar(format_timestamp(&self.created)));
        map.set("updated", FieldValue::scalar(format_timestamp(&self.updated)));
    }
}

fn set_or_remove(map: &mut FieldMap, key: &str, value: Option<String>) {
    match value {
        Some(v) => map.set(key, FieldValue::scalar(v)),
        None => {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontmatter;

    fn sample_task_text() -> String {
        let id = EntityId::generate();
        let project = EntityId::generate();
        format!(
            "---\nid: {id}\nslug: water-plants\ntitle: Water plants\nproject: {project}\n\
status: todo\npriority: med\ntags: [home]\ndue: 2025-09-02\n\
created: 2025-08-01T09:00:00Z\nupdated: 2025-08-01T09:00:00Z\n---\nBalcony first.\n"
        )
    }

    #[test]
    fn test_task_from_parts() {
        let raw = sample_task_text();
        let (map, body) = frontmatter::decode(&raw).unwrap();
        let task = Task::from_parts(&map, &body).unwrap();
        assert_eq!(task.slug, "water-plants");
        assert_eq!(task.status, Status::Todo);
        assert_eq!(task.priority, Priority::Med);
        assert_eq!(task.due, NaiveDate::from_ymd_opt(2025, 9, 2));
        assert_eq!(task.body, "Balcony first.\n");
        assert!(task.parent.is_none());
    }

    #[test]
    fn test_missing_required_field() {
        let raw = "---\nslug: x\nstatus: todo\n---\n";
        let (map, body) = frontmatter::decode(raw).unwrap();
        let err = Task::from_parts(&map, &body).unwrap_err();
        assert!(matches!(err, CoreError::SchemaViolation { .. }));
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let raw = sample_task_text().replace("status: todo", "status: blocked");
        let (map, body) = frontmatter::decode(&raw).unwrap();
        assert!(matches!(
            Task::from_parts(&map, &body),
            Err(CoreError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_bad_date_rejected() {
        let raw = sample_task_text().replace("due: 2025-09-02", "due: next-tuesday");
        let (map, body) = frontmatter::decode(&raw).unwrap();
        assert!(matches!(
            Task::from_parts(&map, &body),
            Err(CoreError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn test_write_to_round_trips_through_header() {
        let raw = sample_task_text();
        let (mut map, body) = frontmatter::decode(&raw).unwrap();
        let mut task = Task::from_parts(&map, &body).unwrap();

        task.status = Status::Done;
        task.due = None;
        task.write_to(&mut map);

        let rewritten = frontmatter::encode(&map, &body);
        let (map2, body2) = frontmatter::decode(&rewritten).unwrap();
        let reread = Task::from_parts(&map2, &body2).unwrap();
        assert_eq!(reread.status, Status::Done);
        assert_eq!(reread.due, None);
        assert!(!rewritten.contains("due:"));
    }

    #[test]
    fn test_recur_block() {
        let raw = sample_task_text().replace(
            "due: 2025-09-02\n",
            "due: 2025-09-02\nrecur:\n  every: week\n  day: monday\n",
        );
        let (map, body) = frontmatter::decode(&raw).unwrap();
        let task = Task::from_parts(&map, &body).unwrap();
        let recur = task.recur.unwrap();
        assert_eq!(recur.every, "week");
        assert_eq!(recur.day.as_deref(), Some("monday"));
    }

    #[test]
    fn test_missing_stamps_fall_back_to_id_time() {
        let id = EntityId::generate();
        let project = EntityId::generate();
        let raw = format!(
            "---\nid: {id}\nslug: bare\nproject: {project}\nstatus: todo\n---\n"
        );
        let (map, body) = frontmatter::decode(&raw).unwrap();
        let task = Task::from_parts(&map, &body).unwrap();
        assert_eq!(
            task.created.timestamp_millis() as u64,
            id.timestamp_ms()
        );
        assert_eq!(task.created, task.updated);
    }

    #[test]
    fn test_status_cycle_order() {
        assert_eq!(Status::Todo.next(), Status::Doing);
        assert_eq!(Status::Doing.next(), Status::Done);
        assert_eq!(Status::Done.next(), Status::Todo);
        assert_eq!(Status::Doing.prev(), Status::Todo);
        assert_eq!(Status::Cancelled.next(), Status::Todo);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low > Priority::None);
        assert_eq!(Priority::parse("medium"), Some(Priority::Med));
    }
}
