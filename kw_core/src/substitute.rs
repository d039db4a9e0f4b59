//! Strict text substitution.
//!
//! A rule that matches nothing (or a different number of times than declared)
//! means the upstream file no longer looks the way the declaration expects.
//! That is reported as a layout mismatch instead of silently installing an
//! unpatched file.

use std::path::Path;

use regex::{NoExpand, RegexBuilder};

use crate::Error;
use crate::package::{MatchKind, Substitution};

/// Apply `rule` to `text`, substituting `replacement` (already expanded).
///
/// Returns the rewritten text and the number of matches replaced.
pub fn apply(
    path: &Path,
    text: &str,
    rule: &Substitution,
    replacement: &str,
) -> Result<(String, usize), Error> {
    let mismatch = |message: String| Error::LayoutMismatch {
        path: path.to_path_buf(),
        message,
    };

    if let Some(n) = rule.count
        && n > 1
        && !rule.replace_all
    {
        return Err(mismatch(format!(
            "pattern '{}' expects {n} matches but replaces only one",
            rule.pattern
        )));
    }

    let (matches, rewritten) = match rule.kind {
        MatchKind::Literal => {
            let matches = text.matches(rule.pattern.as_str()).count();
            let rewritten = if rule.replace_all {
                text.replace(rule.pattern.as_str(), replacement)
            } else {
                text.replacen(rule.pattern.as_str(), replacement, 1)
            };
            (matches, rewritten)
        }
        MatchKind::Regex => {
            let re = RegexBuilder::new(&rule.pattern)
                .multi_line(true)
                .build()
                .map_err(|e| mismatch(format!("invalid pattern '{}': {e}", rule.pattern)))?;
            let matches = re.find_iter(text).count();
            let limit = if rule.replace_all { 0 } else { 1 };
            let rewritten = re.replacen(text, limit, NoExpand(replacement)).into_owned();
            (matches, rewritten)
        }
    };

    if matches == 0 {
        return Err(mismatch(format!("pattern '{}' not found", rule.pattern)));
    }
    if let Some(expected) = rule.expected_matches()
        && matches != expected
    {
        return Err(mismatch(format!(
            "pattern '{}' matched {} times, expected {}",
            rule.pattern, matches, expected
        )));
    }

    let replaced = if rule.replace_all { matches } else { 1 };
    Ok((rewritten, replaced))
}
