//! Query DSL: text in, ordered task ids out.
//!
//! `parse` turns DSL text into an AST, `compile` lowers the AST onto the
//! index's mirrored columns, and execution happens in the index store.
//! Repeated identical queries against an unchanged index return identical
//! order: every sort ends with the creation-time-then-id tie-break.

pub mod compile;
pub mod parse;

pub use compile::compile;
pub use parse::{parse, Clause, Cmp, ParentRef, Query, SortField, SortSpec};
