//! AST to SQL over the index's mirrored columns.

use super::parse::{Clause, Cmp, ParentRef, Query, SortField};
use crate::index::CompiledQuery;

/// A task's due date for query purposes: its own, or the latest among its
/// direct children. Evaluated in SQL so no vault walking happens at query
/// time.
const EFFECTIVE_DUE: &str =
    "COALESCE(t.due, (SELECT MAX(c.due) FROM tasks c WHERE c.parent_id = t.id))";

const HAS_CHILDREN: &str = "EXISTS (SELECT 1 FROM tasks c WHERE c.parent_id = t.id)";

/// Lower a parsed query onto the tasks table. Pure: the same AST always
/// produces the same SQL and parameters.
pub fn compile(query: &Query) -> CompiledQuery {
    let mut fragments: Vec<String> = Vec::new();
    let mut params: Vec<String> = Vec::new();
    let mut terms: Vec<String> = Vec::new();

    for clause in &query.clauses {
        match clause {
            Clause::Text(term) => terms.push(term.clone()),
            Clause::Status(status) => {
                fragments.push("t.status = ?".into());
                params.push(status.as_str().to_string());
            }
            Clause::Priority(cmp, priority) => {
                fragments.push(format!("t.priority {} ?", op(*cmp)));
                params.push(priority.rank().to_string());
            }
            Clause::Project(handle) => {
                fragments
                    .push("t.project_id IN (SELECT id FROM projects WHERE slug = ? OR id = ?)".into());
                params.push(handle.clone());
                params.push(handle.clone());
            }
            Clause::Parent(ParentRef::None) => {
                fragments.push("t.parent_id IS NULL".into());
            }
            Clause::Parent(ParentRef::Handle(handle)) => {
                fragments
                    .push("t.parent_id IN (SELECT id FROM tasks WHERE slug = ? OR id = ?)".into());
                params.push(handle.clone());
                params.push(handle.clone());
            }
            Clause::Tag(tag) => {
                fragments.push("instr(' ' || t.tags || ' ', ?) > 0".into());
                params.push(format!(" {tag} "));
            }
            Clause::Assignee(name) => {
                fragments.push("t.assignee = ?".into());
                params.push(name.clone());
            }
            Clause::Due(cmp, date) => {
                fragments.push(format!("{EFFECTIVE_DUE} {} ?", op(*cmp)));
                params.push(date.to_string());
            }
            Clause::Start(cmp, date) => {
                fragments.push(format!("t.start {} ?", op(*cmp)));
                params.push(date.to_string());
            }
            Clause::Created(cmp, date) => {
                fragments.push(format!("substr(t.created, 1, 10) {} ?", op(*cmp)));
                params.push(date.to_string());
            }
            Clause::Updated(cmp, date) => {
                fragments.push(format!("substr(t.updated, 1, 10) {} ?", op(*cmp)));
                params.push(date.to_string());
            }
            Clause::Done(cmp, date) => {
                fragments.push(format!("substr(t.done_at, 1, 10) {} ?", op(*cmp)));
                params.push(date.to_string());
            }
            Clause::HasChildren => fragments.push(HAS_CHILDREN.into()),
            Clause::IsLeaf => fragments.push(format!("NOT {HAS_CHILDREN}")),
        }
    }

    if !terms.is_empty() {
        fragments.push("t.id IN (SELECT id FROM tasks_fts WHERE tasks_fts MATCH ?)".into());
        params.push(fts_match(&terms));
    }

    let where_sql = if fragments.is_empty() {
        "1 = 1".to_string()
    } else {
        fragments.join(" AND ")
    };

    CompiledQuery {
        where_sql,
        params,
        order_sql: order_sql(query),
    }
}

fn op(cmp: Cmp) -> &'static str {
    match cmp {
        Cmp::Eq => "=",
        Cmp::Lt => "<",
        Cmp::Gt => ">",
    }
}

/// Quote each term so FTS5 treats it as a plain token, AND-joined.
fn fts_match(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn order_sql(query: &Query) -> String {
    let mut order = String::new();
    if let Some(sort) = &query.sort {
        let dir = if sort.descending { " DESC" } else { "" };
        let expr = match sort.field {
            SortField::Due => {
                // Tasks with no due date (own or inherited) sort after dated
                // ones in either direction.
                order.push_str(&format!("({EFFECTIVE_DUE} IS NULL), "));
                EFFECTIVE_DUE
            }
            SortField::Start => {
                order.push_str("(t.start IS NULL), ");
                "t.start"
            }
            SortField::Created => "t.created",
            SortField::Updated => "t.updated",
            SortField::Priority => "t.priority",
            SortField::Title => "t.title COLLATE NOCASE",
            SortField::Position => "t.sort_order",
        };
        order.push_str(expr);
        order.push_str(dir);
        order.push_str(", ");
    }
    // Stable tie-break: creation time then id.
    order.push_str("t.created, t.id");
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse::parse;

    #[test]
    fn test_compile_is_deterministic() {
        let q = parse("project:home status:todo laundry sort:due").unwrap();
        assert_eq!(compile(&q), compile(&q));
    }

    #[test]
    fn test_compile_filters() {
        let q = parse("status:todo tag:home due<2025-09-02").unwrap();
        let compiled = compile(&q);
        assert!(compiled.where_sql.contains("t.status = ?"));
        assert!(compiled.where_sql.contains("instr(' ' || t.tags || ' ', ?)"));
        assert!(compiled.where_sql.contains("MAX(c.due)"));
        assert_eq!(
            compiled.params,
            vec!["todo".to_string(), " home ".to_string(), "2025-09-02".to_string()]
        );
    }

    #[test]
    fn test_compile_full_text_terms_are_quoted() {
        let q = parse("\"dry cleaning\" errands").unwrap();
        let compiled = compile(&q);
        assert!(compiled.where_sql.contains("tasks_fts MATCH ?"));
        assert_eq!(compiled.params, vec!["\"dry cleaning\" \"errands\"".to_string()]);
    }

    #[test]
    fn test_compile_hierarchy_predicates() {
        let q = parse("has:children").unwrap();
        assert!(compile(&q).where_sql.contains("EXISTS"));

        let q = parse("is:leaf").unwrap();
        assert!(compile(&q).where_sql.contains("NOT EXISTS"));

        let q = parse("parent:none").unwrap();
        assert!(compile(&q).where_sql.contains("t.parent_id IS NULL"));
    }

    #[test]
    fn test_empty_query_matches_everything_in_stable_order() {
        let compiled = compile(&parse("").unwrap());
        assert_eq!(compiled.where_sql, "1 = 1");
        assert_eq!(compiled.order_sql, "t.created, t.id");
    }

    #[test]
    fn test_sort_direction() {
        let compiled = compile(&parse("sort:-priority").unwrap());
        assert!(compiled.order_sql.starts_with("t.priority DESC"));
        assert!(compiled.order_sql.ends_with("t.created, t.id"));
    }
}
