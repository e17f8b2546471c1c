//! Frontmatter codec for authoritative entity files.
//!
//! A record is a `---`-delimited header of ordered `key: value` pairs
//! followed by a free-form body. The codec guarantees
//! `encode(decode(x)) == x` byte-for-byte for any well-formed input, which
//! is what lets external editors touch files without the core destroying
//! keys it does not understand. Values are stored as written; typed readers
//! normalize on access, writers normalize on mutation.
//!
//! Supported value shapes: scalars, inline `[a, b]` lists, and one level of
//! nested mapping (an empty `key:` line followed by two-space indented
//! scalar pairs). Anything deeper is rejected.

use crate::error::{CoreError, Result};

const DELIMITER: &str = "---";
const DELIMITER_LINE: &str = "---\n";

/// A single frontmatter value, kept close to its written form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Everything after `key: `, verbatim. Empty string for a bare `key:`
    /// line with no nested block.
    Scalar(String),

    /// Inline list segments between `[` and `]`, split on commas with
    /// original spacing preserved so re-emission is exact.
    List(Vec<String>),

    /// One level of nested scalar pairs.
    Map(Vec<(String, String)>),
}

impl FieldValue {
    pub fn scalar(s: impl Into<String>) -> Self {
        FieldValue::Scalar(s.into())
    }

    /// Canonical list from already-clean items (used by writers).
    pub fn list(items: impl IntoIterator<Item = String>) -> Self {
        let mut out = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            if i == 0 {
                out.push(item);
            } else {
                out.push(format!(" {item}"));
            }
        }
        FieldValue::List(out)
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FieldValue::Scalar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// List items with surrounding whitespace stripped and empties dropped.
    pub fn as_items(&self) -> Vec<String> {
        match self {
            FieldValue::List(segments) => segments
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            FieldValue::Scalar(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        }
    }

    pub fn as_map(&self) -> Option<&[(String, String)]> {
        match self {
            FieldValue::Map(pairs) => Some(pairs.as_slice()),
            _ => None,
        }
    }
}

/// Insertion-ordered key/value header. Unknown keys ride through untouched;
/// `set` on an existing key keeps its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(String, FieldValue)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn set(&mut self, key: &str, value: FieldValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a raw file into its ordered header and body.
pub fn decode(raw: &str) -> Result<(FieldMap, String)> {
    let mut rest = raw
        .strip_prefix(DELIMITER_LINE)
        .ok_or_else(|| malformed("missing opening delimiter"))?;

    let mut map = FieldMap::new();

    loop {
        if rest.is_empty() {
            return Err(malformed("missing closing delimiter"));
        }
        if let Some(body) = rest.strip_prefix(DELIMITER_LINE) {
            return Ok((map, body.to_string()));
        }

        let (line, after) = take_line(rest)?;
        rest = after;

        let (key, value_text) = split_key(line)?;

        if value_text.is_empty() {
            // Bare `key:` is a nested block if indented pairs follow,
            // otherwise an empty scalar.
            let (pairs, after_block) = take_nested_block(rest, &key)?;
            if pairs.is_empty() {
                map_insert(&mut map, key, FieldValue::Scalar(String::new()))?;
            } else {
                rest = after_block;
                map_insert(&mut map, key, FieldValue::Map(pairs))?;
            }
        } else if let Some(inner) = value_text
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
        {
            let segments = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|s| s.to_string()).collect()
            };
            map_insert(&mut map, key, FieldValue::List(segments))?;
        } else {
            map_insert(&mut map, key, FieldValue::Scalar(value_text.to_string()))?;
        }
    }
}

/// Serialize a header and body back to file text. Left inverse of [`decode`].
pub fn encode(map: &FieldMap, body: &str) -> String {
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');

    for (key, value) in map.iter() {
        match value {
            FieldValue::Scalar(s) if s.is_empty() => {
                out.push_str(key);
                out.push_str(":\n");
            }
            FieldValue::Scalar(s) => {
                out.push_str(key);
                out.push_str(": ");
                out.push_str(s);
                out.push('\n');
            }
            FieldValue::List(segments) => {
                out.push_str(key);
                out.push_str(": [");
                out.push_str(&segments.join(","));
                out.push_str("]\n");
            }
            FieldValue::Map(pairs) => {
                out.push_str(key);
                out.push_str(":\n");
                for (sub, val) in pairs {
                    out.push_str("  ");
                    out.push_str(sub);
                    out.push_str(": ");
                    out.push_str(val);
                    out.push('\n');
                }
            }
        }
    }

    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(body);
    out
}

fn malformed(reason: impl Into<String>) -> CoreError {
    CoreError::MalformedRecord {
        path: None,
        reason: reason.into(),
    }
}

fn take_line(text: &str) -> Result<(&str, &str)> {
    match text.find('\n') {
        Some(idx) => Ok((&text[..idx], &text[idx + 1..])),
        None => Err(malformed("header line is not newline-terminated")),
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn split_key(line: &str) -> Result<(String, &str)> {
    let colon = line
        .find(':')
        .ok_or_else(|| malformed(format!("line '{line}' is not a key: value pair")))?;
    let key = &line[..colon];
    if !valid_key(key) {
        return Err(malformed(format!("invalid key '{key}'")));
    }
    let rest = &line[colon + 1..];
    if rest.is_empty() {
        Ok((key.to_string(), ""))
    } else if let Some(value) = rest.strip_prefix(' ') {
        Ok((key.to_string(), value))
    } else {
        Err(malformed(format!("missing space after ':' in '{line}'")))
    }
}

/// Consume two-space indented `sub: value` lines following a bare `key:`.
/// Deeper indentation or a nested block inside means the shape is not
/// representable.
fn take_nested_block<'a>(
    mut rest: &'a str,
    parent: &str,
) -> Result<(Vec<(String, String)>, &'a str)> {
    let mut pairs = Vec::new();
    loop {
        let Some(stripped) = rest.strip_prefix("  ") else {
            return Ok((pairs, rest));
        };
        if stripped.starts_with(' ') {
            return Err(CoreError::UnsupportedShape {
                key: parent.to_string(),
            });
        }
        let (line, after) = take_line(stripped)?;
        let (sub, value_text) = split_key(line)?;
        if value_text.is_empty() {
            // `sub:` inside a block would start a second nesting level.
            return Err(CoreError::UnsupportedShape {
                key: format!("{parent}.{sub}"),
            });
        }
        pairs.push((sub, value_text.to_string()));
        rest = after;
    }
}

fn map_insert(map: &mut FieldMap, key: String, value: FieldValue) -> Result<()> {
    if map.contains(&key) {
        return Err(malformed(format!("duplicate key '{key}'")));
    }
    map.set(&key, value);
    Ok(())
}
