//! Unified diff generation for `Patch.unified_diff` (spec §3).
//!
//! Uses `similar`, the same line-diffing crate several repos in this
//! ecosystem reach for rather than hand-rolling an LCS diff.

use similar::{ChangeTag, TextDiff};

/// Produce a minimal unified diff between `before` and `after` for
/// `file_path`. Good enough for the size gate in spec §4.5 (counting `+`/`-`
/// lines) and for human review in commit messages — not meant to be applied
/// by `patch(1)`.
pub fn unified_diff(file_path: &str, before: &str, after: &str) -> String {
    let diff = TextDiff::from_lines(before, after);
    let mut out = String::new();
    out.push_str(&format!("--- a/{file_path}\n"));
    out.push_str(&format!("+++ b/{file_path}\n"));
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "-",
            ChangeTag::Insert => "+",
            ChangeTag::Equal => " ",
        };
        out.push_str(sign);
        out.push_str(change.value());
        if !change.value().ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_marks_added_and_removed_lines() {
        let before = "def f(a, b)\n    return a-b\n";
        let after = "def f(a, b):\n    return a-b\n";
        let diff = unified_diff("math.py", before, after);
        assert!(diff.contains("-def f(a, b)\n"));
        assert!(diff.contains("+def f(a, b):\n"));
    }

    #[test]
    fn identical_text_has_no_changed_lines() {
        let text = "a\nb\nc\n";
        let diff = unified_diff("x.py", text, text);
        let changed = diff.lines().filter(|l| l.starts_with('+') || l.starts_with('-')).count();
        // Only the --- / +++ headers start with +/-, no body changes.
        assert_eq!(changed, 2);
    }
}
