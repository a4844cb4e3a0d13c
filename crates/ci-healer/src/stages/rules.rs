//! Deterministic rule engine (spec §4.5): per-failure-type mechanical source
//! rewrites used as the fallback patch source when the LLM is unavailable,
//! disabled, or rate-limited. Every rule operates on a single file's full
//! text and the failure's reported line, returning `None` when the heuristic
//! doesn't apply to the observed code — callers chain rules rather than
//! fail outright (spec §4.5, UNKNOWN/LOGIC/LINTING failures).

use crate::types::{Failure, FailureType};

/// Attempt a deterministic fix. `line_idx` is 0-based.
pub fn apply(failure: &Failure, source: &str) -> Option<(String, String)> {
    match failure.failure_type {
        FailureType::Syntax => fix_syntax(failure, source),
        FailureType::Indentation => fix_indentation(failure, source),
        FailureType::Import => fix_missing_import(failure, source),
        FailureType::TypeError => fix_type_error(failure, source),
        FailureType::Runtime => fix_runtime(failure, source),
        FailureType::Logic | FailureType::Linting | FailureType::Unknown => {
            fix_syntax(failure, source)
                .or_else(|| fix_type_error(failure, source))
                .or_else(|| fix_runtime(failure, source))
                .or_else(|| strip_lru_cache_with_self(source))
        }
        FailureType::Dependency | FailureType::TestFailure => None,
    }
}

fn line_index(failure: &Failure, line_count: usize) -> Option<usize> {
    if failure.line == 0 {
        return None;
    }
    let idx = (failure.line - 1) as usize;
    if idx < line_count {
        Some(idx)
    } else {
        None
    }
}

/// SYNTAX: the most common mechanical miss is a missing trailing colon on a
/// block-opening statement (`def`, `if`, `for`, `while`, `class`, `else`,
/// `elif`, `try`, `except`, `finally`, `with`).
fn fix_syntax(failure: &Failure, source: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = source.lines().collect();
    let idx = line_index(failure, lines.len())?;
    let line = lines[idx];
    let trimmed = line.trim_end();
    if trimmed.ends_with(':') || trimmed.is_empty() {
        return None;
    }
    const BLOCK_KEYWORDS: &[&str] = &[
        "def ", "if ", "elif ", "else", "for ", "while ", "class ", "try", "except", "finally", "with ",
    ];
    let stripped = trimmed.trim_start();
    if BLOCK_KEYWORDS.iter().any(|kw| stripped.starts_with(kw) || stripped == kw.trim()) {
        let mut patched_lines = lines.clone();
        let fixed_line = format!("{trimmed}:");
        let owned = fixed_line;
        patched_lines[idx] = &owned;
        let patched = patched_lines.join("\n");
        return Some((source.to_string(), with_trailing_newline(source, &patched)));
    }
    None
}

/// INDENTATION: re-indent a line flagged by the interpreter to match its
/// block's existing indentation level (the previous non-blank line's depth).
fn fix_indentation(failure: &Failure, source: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = source.lines().collect();
    let idx = line_index(failure, lines.len())?;
    let target = lines[idx];
    let mut prev_indent = None;
    for l in lines[..idx].iter().rev() {
        if !l.trim().is_empty() {
            prev_indent = Some(l.len() - l.trim_start().len());
            break;
        }
    }
    let prev_indent = prev_indent?;
    let content = target.trim_start();
    if content.is_empty() {
        return None;
    }
    let mut patched_lines = lines.clone();
    let fixed = format!("{}{}", " ".repeat(prev_indent), content);
    patched_lines[idx] = &fixed;
    let patched = patched_lines.join("\n");
    Some((source.to_string(), with_trailing_newline(source, &patched)))
}

/// IMPORT: insert `import <module>` at the top of the file for the module
/// named in the failure message (`No module named 'x'` / `name 'x' is not
/// defined`), when it matches a well-known standard-library module.
fn fix_missing_import(failure: &Failure, source: &str) -> Option<(String, String)> {
    const STD_MODULES: &[&str] = &[
        "os", "sys", "re", "json", "math", "random", "itertools", "functools", "collections",
        "datetime", "time", "typing", "pathlib", "subprocess", "logging", "copy", "io",
    ];

    let module = extract_quoted_name(&failure.message)?;
    let candidate = module.split('.').next().unwrap_or(&module);
    if !STD_MODULES.contains(&candidate) {
        return None;
    }
    if source.lines().any(|l| l.trim() == format!("import {candidate}")) {
        return None;
    }
    let patched = format!("import {candidate}\n{source}");
    Some((source.to_string(), patched))
}

fn extract_quoted_name(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let rest = &message[start + 1..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

/// TYPE_ERROR: the canonical seed-scenario mismatch is a function that
/// stringifies a value it should return as-is (`return str(x)` when callers
/// expect the original type back).
fn fix_type_error(failure: &Failure, source: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = source.lines().collect();
    let idx = line_index(failure, lines.len())?;
    let line = lines[idx];
    let trimmed = line.trim_start();
    if let Some(inner) = trimmed.strip_prefix("return str(").and_then(|s| s.strip_suffix(')')) {
        let indent = &line[..line.len() - trimmed.len()];
        let fixed = format!("{indent}return {inner}");
        let mut patched_lines = lines.clone();
        patched_lines[idx] = &fixed;
        let patched = patched_lines.join("\n");
        return Some((source.to_string(), with_trailing_newline(source, &patched)));
    }
    None
}

/// RUNTIME: handle the two most common mechanical causes — a builtin module
/// attribute used without importing it, and a parameter typo that matches a
/// same-scope neighbor by edit distance 1.
fn fix_runtime(failure: &Failure, source: &str) -> Option<(String, String)> {
    fix_missing_import(failure, source).or_else(|| fix_name_typo(failure, source))
}

fn fix_name_typo(failure: &Failure, source: &str) -> Option<(String, String)> {
    let bad_name = extract_quoted_name(&failure.message)?;
    let lines: Vec<&str> = source.lines().collect();
    let idx = line_index(failure, lines.len())?;
    let line = lines[idx];

    let candidates = collect_identifiers(source);
    let closest = candidates
        .iter()
        .filter(|c| **c != bad_name)
        .find(|c| edit_distance_one(&bad_name, c))?;

    if !line.contains(&bad_name) {
        return None;
    }
    let fixed = line.replacen(&bad_name, closest, 1);
    let mut patched_lines = lines.clone();
    patched_lines[idx] = &fixed;
    let patched = patched_lines.join("\n");
    Some((source.to_string(), with_trailing_newline(source, &patched)))
}

fn collect_identifiers(source: &str) -> Vec<String> {
    let re = regex::Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b").unwrap();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for cap in re.find_iter(source) {
        let s = cap.as_str().to_string();
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

fn edit_distance_one(a: &str, b: &str) -> bool {
    if a == b {
        return false;
    }
    let (a, b) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if b.len() - a.len() > 1 {
        return false;
    }
    if a.len() == b.len() {
        a.chars().zip(b.chars()).filter(|(x, y)| x != y).count() == 1
    } else {
        // one insertion apart
        let mut ai = a.chars().peekable();
        let mut bi = b.chars();
        let mut mismatches = 0;
        for bc in bi.by_ref() {
            match ai.peek() {
                Some(ac) if *ac == bc => {
                    ai.next();
                }
                _ => {
                    mismatches += 1;
                    if mismatches > 1 {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// LOGIC fallback heuristic: `@lru_cache` on a method whose first parameter
/// is `self` silently breaks memoization across instances — strip the
/// decorator line.
fn strip_lru_cache_with_self(source: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = source.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if line.trim_start().starts_with("@lru_cache") || line.trim_start().starts_with("@functools.lru_cache") {
            if let Some(next) = lines.get(i + 1) {
                if next.contains("def ") && next.contains("(self") {
                    let mut patched_lines = lines.clone();
                    patched_lines.remove(i);
                    let patched = patched_lines.join("\n");
                    return Some((source.to_string(), with_trailing_newline(source, &patched)));
                }
            }
        }
    }
    None
}

fn with_trailing_newline(original: &str, patched: &str) -> String {
    if original.ends_with('\n') && !patched.ends_with('\n') {
        format!("{patched}\n")
    } else {
        patched.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn failure(failure_type: FailureType, line: u32, message: &str) -> Failure {
        Failure::new(failure_type, Severity::Critical, "a.py", line, 0, message, "")
    }

    #[test]
    fn syntax_rule_appends_missing_colon() {
        let source = "def f()\n    return 1\n";
        let f = failure(FailureType::Syntax, 1, "SyntaxError: expected ':'");
        let (_, patched) = apply(&f, source).unwrap();
        assert!(patched.lines().next().unwrap().ends_with(':'));
    }

    #[test]
    fn syntax_rule_skips_non_block_lines() {
        let source = "x = 1\n";
        let f = failure(FailureType::Syntax, 1, "SyntaxError: invalid syntax");
        assert!(apply(&f, source).is_none());
    }

    #[test]
    fn indentation_rule_matches_previous_block_depth() {
        let source = "if True:\n    x = 1\ny = 2\n";
        let f = failure(FailureType::Indentation, 3, "IndentationError: unexpected indent");
        let (_, patched) = apply(&f, source).unwrap();
        assert_eq!(patched.lines().nth(2).unwrap(), "    y = 2");
    }

    #[test]
    fn import_rule_inserts_stdlib_module() {
        let source = "print(os.getcwd())\n";
        let f = failure(FailureType::Import, 1, "ModuleNotFoundError: No module named 'os'");
        let (_, patched) = apply(&f, source).unwrap();
        assert_eq!(patched.lines().next().unwrap(), "import os");
    }

    #[test]
    fn type_error_rule_removes_str_wrapper() {
        let source = "def f(x):\n    return str(x)\n";
        let f = failure(FailureType::TypeError, 2, "TypeError: expected int, got str");
        let (_, patched) = apply(&f, source).unwrap();
        assert_eq!(patched.lines().nth(1).unwrap().trim(), "return x");
    }

    #[test]
    fn runtime_rule_fixes_name_typo_by_edit_distance() {
        let source = "def f(value):\n    return valu + 1\n";
        let f = failure(FailureType::Runtime, 2, "NameError: name 'valu' is not defined");
        let (_, patched) = apply(&f, source).unwrap();
        assert!(patched.lines().nth(1).unwrap().contains("value"));
    }

    #[test]
    fn logic_fallback_strips_lru_cache_on_self_method() {
        let source = "class C:\n    @lru_cache\n    def f(self, x):\n        return x\n";
        let f = failure(FailureType::Logic, 4, "stale cached result across instances");
        let (_, patched) = apply(&f, source).unwrap();
        assert!(!patched.contains("@lru_cache"));
    }
}
