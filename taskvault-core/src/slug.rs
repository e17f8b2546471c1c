//! Slug derivation for entity filenames and handles.

use regex::Regex;
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;

static HYPHEN_RUNS: OnceLock<Regex> = OnceLock::new();

fn hyphen_runs() -> &'static Regex {
    HYPHEN_RUNS.get_or_init(|| Regex::new(r"-+").unwrap())
}

/// Derive a filesystem- and handle-safe slug from a title.
///
/// Lowercases, maps whitespace and underscores to hyphens, drops anything
/// that is not alphanumeric (unicode letters survive), collapses hyphen
/// runs, and trims the ends.
///
/// # Examples
///
/// ```
/// use taskvault_core::slug::slugify;
///
/// assert_eq!(slugify("Pick up dry cleaning"), "pick-up-dry-cleaning");
/// assert_eq!(slugify("Ship v2.0!"), "ship-v20");
/// ```
pub fn slugify(input: &str) -> String {
    let lowered = input.to_lowercase();

    let mapped = lowered
        .graphemes(true)
        .filter_map(|g| {
            let c = g.chars().next()?;
            match c {
                ' ' | '_' | '\t' | '\n' => Some("-"),
                _ if c.is_ascii_alphanumeric() || c == '-' => Some(g),
                _ if c.is_alphabetic() => Some(g),
                _ => None,
            }
        })
        .collect::<String>();

    hyphen_runs()
        .replace_all(&mapped, "-")
        .trim_matches('-')
        .to_string()
}

/// Slug for a title that may come out empty (punctuation-only titles).
/// Falls back to `untitled` so a path component always exists.
pub fn slug_or_untitled(title: &str) -> String {
    let s = slugify(title);
    if s.is_empty() {
        "untitled".to_string()
    } else {
        s
    }
}

/// Disambiguate a slug against a set of already-taken slugs by appending a
/// numeric suffix: `inbox`, `inbox-2`, `inbox-3`, ...
pub fn dedupe_slug(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_titles() {
        assert_eq!(slugify("Pick up dry cleaning"), "pick-up-dry-cleaning");
        assert_eq!(slugify("Fix   flaky  CI"), "fix-flaky-ci");
        assert_eq!(slugify("review_PR_#42"), "review-pr-42");
        assert_eq!(slugify("--edges--"), "edges");
    }

    #[test]
    fn test_slugify_keeps_unicode_letters() {
        assert_eq!(slugify("Café plan"), "café-plan");
        assert_eq!(slugify("überholen"), "überholen");
    }

    #[test]
    fn test_empty_falls_back() {
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slug_or_untitled("!!!"), "untitled");
        assert_eq!(slug_or_untitled("Real Title"), "real-title");
    }

    #[test]
    fn test_dedupe_slug() {
        let taken = ["inbox".to_string(), "inbox-2".to_string()];
        let is_taken = |s: &str| taken.iter().any(|t| t == s);
        assert_eq!(dedupe_slug("errands", is_taken), "errands");
        assert_eq!(dedupe_slug("inbox", is_taken), "inbox-3");
    }
}
