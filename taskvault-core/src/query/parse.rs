//! DSL text to AST. Pure and deterministic: the same text always yields the
//! same AST, with no index access.

use crate::error::{CoreError, Result};
use crate::models::{Priority, Status};
use chrono::NaiveDate;

/// Comparison carried by a `field:value`, `field<value`, or `field>value`
/// clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Lt,
    Gt,
}

/// A `parent:` constraint: explicitly top-level, or under some handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    None,
    Handle(String),
}

/// One parsed clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Bare term, matched against the full-text fields.
    Text(String),
    Status(Status),
    Priority(Cmp, Priority),
    /// Project slug or id.
    Project(String),
    Parent(ParentRef),
    Tag(String),
    Assignee(String),
    Due(Cmp, NaiveDate),
    Start(Cmp, NaiveDate),
    Created(Cmp, NaiveDate),
    Updated(Cmp, NaiveDate),
    Done(Cmp, NaiveDate),
    HasChildren,
    IsLeaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    /// Effective due date (own, or latest child's).
    Due,
    Start,
    Created,
    Updated,
    Priority,
    Title,
    /// Sibling sort position.
    Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub field: SortField,
    pub descending: bool,
}

/// A full parsed query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub clauses: Vec<Clause>,
    pub sort: Option<SortSpec>,
}

/// Parse DSL text. Fails with `UnknownField` for fields the index does not
/// mirror and `InvalidValue` naming the offending clause.
pub fn parse(text: &str) -> Result<Query> {
    let mut query = Query::default();

    for token in tokenize(text) {
        if let Some((field, cmp, value)) = split_constraint(&token) {
            if field == "sort" {
                if cmp != Cmp::Eq {
                    return Err(invalid(&token, "sort takes 'sort:field'"));
                }
                query.sort = Some(parse_sort(&token, value)?);
            } else {
                query.clauses.push(parse_clause(&token, field, cmp, value)?);
            }
        } else {
            query.clauses.push(Clause::Text(token));
        }
    }

    Ok(query)
}

/// Split on whitespace, keeping double-quoted phrases intact.
fn tokenize(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// `field:value` / `field<value` / `field>value`, or `None` for a bare term.
/// The field must look like an identifier; anything else (a URL, a time) is
/// treated as text.
fn split_constraint(token: &str) -> Option<(&str, Cmp, &str)> {
    let idx = token.find([':', '<', '>'])?;
    let field = &token[..idx];
    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_')
    {
        return None;
    }
    let cmp = match &token[idx..idx + 1] {
        ":" => Cmp::Eq,
        "<" => Cmp::Lt,
        ">" => Cmp::Gt,
        _ => unreachable!(),
    };
    Some((field, cmp, &token[idx + 1..]))
}

fn parse_clause(token: &str, field: &str, cmp: Cmp, value: &str) -> Result<Clause> {
    if value.is_empty() {
        return Err(invalid(token, "empty value"));
    }

    match field {
        "status" => {
            require_eq(token, field, cmp)?;
            Status::parse(value)
                .map(Clause::Status)
                .ok_or_else(|| invalid(token, "expected todo|doing|done|cancelled"))
        }
        "priority" => Priority::parse(value)
            .map(|p| Clause::Priority(cmp, p))
            .ok_or_else(|| invalid(token, "expected none|low|med|high|urgent")),
        "project" => {
            require_eq(token, field, cmp)?;
            Ok(Clause::Project(value.to_string()))
        }
        "parent" => {
            require_eq(token, field, cmp)?;
            if value == "none" {
                Ok(Clause::Parent(ParentRef::None))
            } else {
                Ok(Clause::Parent(ParentRef::Handle(value.to_string())))
            }
        }
        "tag" => {
            require_eq(token, field, cmp)?;
            Ok(Clause::Tag(value.to_string()))
        }
        "assignee" => {
            require_eq(token, field, cmp)?;
            Ok(Clause::Assignee(value.to_string()))
        }
        "due" => Ok(Clause::Due(cmp, parse_date(token, value)?)),
        "start" => Ok(Clause::Start(cmp, parse_date(token, value)?)),
        "created" => Ok(Clause::Created(cmp, parse_date(token, value)?)),
        "updated" => Ok(Clause::Updated(cmp, parse_date(token, value)?)),
        "done" => Ok(Clause::Done(cmp, parse_date(token, value)?)),
        "has" => {
            require_eq(token, field, cmp)?;
            if value == "children" {
                Ok(Clause::HasChildren)
            } else {
                Err(invalid(token, "expected has:children"))
            }
        }
        "is" => {
            require_eq(token, field, cmp)?;
            if value == "leaf" {
                Ok(Clause::IsLeaf)
            } else {
                Err(invalid(token, "expected is:leaf"))
            }
        }
        _ => Err(CoreError::UnknownField {
            field: field.to_string(),
        }),
    }
}

fn parse_sort(token: &str, value: &str) -> Result<SortSpec> {
    let (name, descending) = match value.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (value, false),
    };
    let field = match name {
        "due" => SortField::Due,
        "start" => SortField::Start,
        "created" => SortField::Created,
        "updated" => SortField::Updated,
        "priority" => SortField::Priority,
        "title" => SortField::Title,
        "position" => SortField::Position,
        _ => return Err(invalid(token, "unknown sort field")),
    };
    Ok(SortSpec { field, descending })
}

fn require_eq(token: &str, field: &str, cmp: Cmp) -> Result<()> {
    if cmp == Cmp::Eq {
        Ok(())
    } else {
        Err(invalid(token, &format!("{field} only supports ':'")))
    }
}

fn parse_date(token: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| invalid(token, "expected YYYY-MM-DD"))
}

fn invalid(clause: &str, reason: &str) -> CoreError {
    CoreError::InvalidValue {
        clause: clause.to_string(),
        reason: reason.to_string(),
    }
}
