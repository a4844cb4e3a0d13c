//! Stage 4 — Failure Classifier (spec §4.3).
//!
//! Turns a `TestRunResult`'s raw/structured output into a deduplicated,
//! severity-sorted `Vec<Failure>`. The static scan is a regex/heuristic
//! pattern table rather than an AST walk — no tree-sitter-based source file
//! in the retrieved pack showed a concrete style to ground an AST walk on,
//! and a heuristic scanner matches the style of the teacher's own
//! `policy_engine`/`advanced_validator` modules. A proactive LLM pass
//! supplements the static scan when few failures were found mechanically and
//! a provider is configured.

use regex::Regex;

use crate::llm::LlmProvider;
use crate::types::{FailureType, Language, RunState, Severity};
use crate::types::Failure;

struct PatternRule {
    exception_re: &'static str,
    failure_type: FailureType,
    severity: Severity,
}

const PYTHON_RULES: &[PatternRule] = &[
    PatternRule { exception_re: r"SyntaxError", failure_type: FailureType::Syntax, severity: Severity::Critical },
    PatternRule { exception_re: r"IndentationError|TabError", failure_type: FailureType::Indentation, severity: Severity::Critical },
    PatternRule { exception_re: r"ModuleNotFoundError|ImportError", failure_type: FailureType::Import, severity: Severity::Critical },
    PatternRule { exception_re: r"No matching distribution|PackageNotFoundError", failure_type: FailureType::Dependency, severity: Severity::Critical },
    PatternRule { exception_re: r"TypeError", failure_type: FailureType::TypeError, severity: Severity::High },
    PatternRule { exception_re: r"NameError|AttributeError|KeyError|ValueError|ZeroDivisionError|RuntimeError|IndexError", failure_type: FailureType::Runtime, severity: Severity::High },
    PatternRule { exception_re: r"AssertionError", failure_type: FailureType::TestFailure, severity: Severity::Medium },
];

const NODE_RULES: &[PatternRule] = &[
    PatternRule { exception_re: r"SyntaxError", failure_type: FailureType::Syntax, severity: Severity::Critical },
    PatternRule { exception_re: r"Cannot find module|MODULE_NOT_FOUND", failure_type: FailureType::Import, severity: Severity::Critical },
    PatternRule { exception_re: r"npm ERR!|could not resolve dependency", failure_type: FailureType::Dependency, severity: Severity::Critical },
    PatternRule { exception_re: r"TypeError", failure_type: FailureType::TypeError, severity: Severity::High },
    PatternRule { exception_re: r"ReferenceError|RangeError", failure_type: FailureType::Runtime, severity: Severity::High },
    PatternRule { exception_re: r"expect\(|AssertionError", failure_type: FailureType::TestFailure, severity: Severity::Medium },
];

const JAVA_RULES: &[PatternRule] = &[
    PatternRule { exception_re: r"error: .*expected|cannot find symbol|COMPILATION ERROR", failure_type: FailureType::Syntax, severity: Severity::Critical },
    PatternRule { exception_re: r"ClassNotFoundException|NoClassDefFoundError|package .* does not exist", failure_type: FailureType::Import, severity: Severity::Critical },
    PatternRule { exception_re: r"Could not resolve dependenc|Could not find artifact", failure_type: FailureType::Dependency, severity: Severity::Critical },
    PatternRule { exception_re: r"ClassCastException", failure_type: FailureType::TypeError, severity: Severity::High },
    PatternRule { exception_re: r"NullPointerException|ArrayIndexOutOfBoundsException|IllegalStateException|IllegalArgumentException", failure_type: FailureType::Runtime, severity: Severity::High },
    PatternRule { exception_re: r"AssertionError|ComparisonFailure", failure_type: FailureType::TestFailure, severity: Severity::Medium },
];

fn rules_for(language: Language) -> &'static [PatternRule] {
    match language {
        Language::Python => PYTHON_RULES,
        Language::Node => NODE_RULES,
        Language::Java => JAVA_RULES,
        Language::Unknown => &[],
    }
}

fn location_regex(language: Language) -> Regex {
    match language {
        Language::Python => Regex::new(r#"File "(?P<file>[^"]+)", line (?P<line>\d+)"#).unwrap(),
        Language::Node => Regex::new(r"\((?P<file>[^():\s]+\.[jt]sx?):(?P<line>\d+)(?::(?P<col>\d+))?\)").unwrap(),
        Language::Java => Regex::new(r"\(([\w$]+\.java):(?P<line>\d+)\)").unwrap(),
        Language::Unknown => Regex::new(r"(?P<file>never_matches_anything_xyz)").unwrap(),
    }
}

/// Extract `(file, line)` from a trace by taking the LAST location match
/// (spec §4.3: "last-match-wins" — the innermost/most-recent frame in a
/// traceback is listed last and is the most likely root-cause site).
fn extract_location(language: Language, trace: &str) -> (Option<String>, Option<u32>) {
    let re = location_regex(language);
    let mut last_file = None;
    let mut last_line = None;
    for cap in re.captures_iter(trace) {
        if let Some(f) = cap.name("file") {
            last_file = Some(f.as_str().to_string());
        }
        if let Some(l) = cap.name("line") {
            last_line = l.as_str().parse().ok();
        }
    }
    (last_file, last_line)
}

fn classify_trace(language: Language, trace: &str) -> Option<(FailureType, Severity)> {
    rules_for(language)
        .iter()
        .find(|rule| Regex::new(rule.exception_re).unwrap().is_match(trace))
        .map(|rule| (rule.failure_type, rule.severity))
}

/// Scan for linter output lines (flake8 `E###`/`W###` codes, ESLint
/// `<file>:<line>:<col>  error  <msg>` rows) and tag them as LINTING.
fn scan_lint_lines(raw_output: &str) -> Vec<Failure> {
    let flake8_re = Regex::new(r"^(?P<file>[^\s:]+):(?P<line>\d+):\d+: (?P<code>[EWF]\d{3}) (?P<msg>.+)$").unwrap();
    let eslint_re = Regex::new(r"^\s*(?P<line>\d+):\d+\s+error\s+(?P<msg>.+)$").unwrap();

    let mut out = Vec::new();
    let mut current_file: Option<String> = None;
    for line in raw_output.lines() {
        if let Some(cap) = flake8_re.captures(line) {
            out.push(Failure::new(
                FailureType::Linting,
                Severity::Low,
                &cap["file"],
                cap["line"].parse().unwrap_or(0),
                0,
                format!("{}: {}", &cap["code"], &cap["msg"]),
                line,
            ));
            continue;
        }
        if let Some(cap) = eslint_re.captures(line) {
            if let Some(file) = &current_file {
                out.push(Failure::new(
                    FailureType::Linting,
                    Severity::Low,
                    file,
                    cap["line"].parse().unwrap_or(0),
                    0,
                    cap["msg"].to_string(),
                    line,
                ));
            }
            continue;
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.contains(' ') && (trimmed.ends_with(".js") || trimmed.ends_with(".ts")) {
            current_file = Some(trimmed.to_string());
        }
    }
    out
}

/// Static regex scan over every trace captured by the test run.
fn static_scan(language: Language, traces: &[String], raw_output: &str) -> Vec<Failure> {
    let mut failures = Vec::new();

    for trace in traces {
        let Some((failure_type, severity)) = classify_trace(language, trace) else {
            continue;
        };
        let (file, line) = extract_location(language, trace);
        let message = trace.lines().last().unwrap_or(trace).trim().to_string();
        failures.push(Failure::new(
            failure_type,
            severity,
            file.unwrap_or_default(),
            line.unwrap_or(0),
            0,
            message,
            trace.clone(),
        ));
    }

    // Traces are the structured path; when none were captured, fall back to
    // scanning the merged raw output itself as one big trace.
    if traces.is_empty() {
        if let Some((failure_type, severity)) = classify_trace(language, raw_output) {
            let (file, line) = extract_location(language, raw_output);
            failures.push(Failure::new(
                failure_type,
                severity,
                file.unwrap_or_default(),
                line.unwrap_or(0),
                0,
                raw_output.lines().last().unwrap_or(raw_output).trim(),
                raw_output,
            ));
        }
    }

    failures.extend(scan_lint_lines(raw_output));
    failures
}

/// Dedup by (type, file, line, message[:80]) per spec §4.3 rule 6, preserving
/// first-seen order.
fn dedup(failures: Vec<Failure>) -> Vec<Failure> {
    let mut seen = std::collections::HashSet::new();
    failures
        .into_iter()
        .filter(|f| seen.insert(f.dedup_key()))
        .collect()
}

/// Sort CRITICAL-first (spec §4.3 rule 7); `Severity`'s derived `Ord` is
/// ascending so we reverse the comparison.
fn order_failures(failures: &mut [Failure]) {
    failures.sort_by(|a, b| b.severity.cmp(&a.severity));
}

/// CI-log enrichment (spec §4.3): when a prior CI log signaled an
/// environment/dependency problem, bump matching IMPORT/DEPENDENCY failures
/// to CRITICAL and move them to the front.
fn enrich_with_ci_signals(failures: &mut Vec<Failure>, state: &RunState) {
    if state.ci_signals.is_empty() {
        return;
    }
    let has_env_signal = state.ci_signals.iter().any(|s| s.looks_like_env_or_dependency);
    if !has_env_signal {
        return;
    }

    let mut bumped_indices = Vec::new();
    for (i, f) in failures.iter_mut().enumerate() {
        if matches!(f.failure_type, FailureType::Import | FailureType::Dependency) {
            f.severity = Severity::Critical;
            bumped_indices.push(i);
        }
    }
    if bumped_indices.is_empty() {
        return;
    }

    let mut bumped: Vec<Failure> = Vec::new();
    let mut rest: Vec<Failure> = Vec::new();
    for (i, f) in std::mem::take(failures).into_iter().enumerate() {
        if bumped_indices.contains(&i) {
            bumped.push(f);
        } else {
            rest.push(f);
        }
    }
    bumped.extend(rest);
    *failures = bumped;
}

/// Proactive LLM scan: when the static scan under-performed (<3 failures)
/// and a real provider is configured, ask it to surface anything the
/// regex table missed in the raw output (spec §4.3).
async fn proactive_llm_scan(
    llm: &dyn LlmProvider,
    language: Language,
    raw_output: &str,
) -> Vec<Failure> {
    let prompt = format!(
        "The following is test/build output for a {language} project. \
         List any additional failures not already obvious as a single \
         failure per line in the form `TYPE|file|line|message`, where TYPE \
         is one of SYNTAX, IMPORT, TYPE_ERROR, RUNTIME, LOGIC, LINTING, \
         UNKNOWN. Output nothing else.\n\n{raw}",
        raw = truncate(raw_output, 4000)
    );

    let Ok(response) = llm.generate(&prompt, 0.0).await else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for line in response.lines() {
        let parts: Vec<&str> = line.splitn(4, '|').collect();
        if parts.len() != 4 {
            continue;
        }
        let failure_type = match parts[0].trim() {
            "SYNTAX" => FailureType::Syntax,
            "IMPORT" => FailureType::Import,
            "TYPE_ERROR" => FailureType::TypeError,
            "RUNTIME" => FailureType::Runtime,
            "LOGIC" => FailureType::Logic,
            "LINTING" => FailureType::Linting,
            _ => FailureType::Unknown,
        };
        let file = parts[1].trim().to_string();
        let line_no: u32 = parts[2].trim().parse().unwrap_or(0);
        let message = parts[3].trim().to_string();
        out.push(Failure::new(failure_type, Severity::Medium, file, line_no, 0, message, line));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s[..max].to_string()
    }
}

/// Stage entry point.
pub async fn run(state: &mut RunState, llm: Option<&dyn LlmProvider>) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let before = state.failures.len() as u32;

    let mut failures = static_scan(state.language, &state.stack_traces, &state.raw_test_output);

    if failures.len() < 3 {
        if let Some(provider) = llm {
            let extra = proactive_llm_scan(provider, state.language, &state.raw_test_output).await;
            failures.extend(extra);
        }
    }

    let mut failures = dedup(failures);
    enrich_with_ci_signals(&mut failures, state);
    order_failures(&mut failures);

    let after = failures.len() as u32;
    state.failures = failures;

    tracing::info!(run_id = %state.run_id, failure_count = after, "failures classified");
    state.push_event(
        "FAILURES_CLASSIFIED",
        format!("Classified {after} failure(s)"),
        before,
        after,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmProvider;

    #[test]
    fn python_syntax_error_extracts_file_and_line() {
        let trace = "File \"app.py\", line 10\n    def f(\nSyntaxError: unexpected EOF while parsing";
        let failures = static_scan(Language::Python, &[trace.to_string()], "");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure_type, FailureType::Syntax);
        assert_eq!(failures[0].file_path, "app.py");
        assert_eq!(failures[0].line, 10);
    }

    #[test]
    fn last_match_wins_for_nested_tracebacks() {
        let trace = "File \"a.py\", line 1, in <module>\nFile \"b.py\", line 22, in helper\nTypeError: boom";
        let (file, line) = extract_location(Language::Python, trace);
        assert_eq!(file.unwrap(), "b.py");
        assert_eq!(line.unwrap(), 22);
    }

    #[test]
    fn dedup_collapses_identical_failures() {
        let f1 = Failure::new(FailureType::Syntax, Severity::Critical, "a.py", 1, 0, "boom", "t1");
        let f2 = Failure::new(FailureType::Syntax, Severity::Critical, "a.py", 1, 0, "boom", "t2");
        let deduped = dedup(vec![f1, f2]);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn order_failures_sorts_critical_first() {
        let mut failures = vec![
            Failure::new(FailureType::Linting, Severity::Low, "a.py", 1, 0, "m", "t"),
            Failure::new(FailureType::Syntax, Severity::Critical, "b.py", 2, 0, "m", "t"),
        ];
        order_failures(&mut failures);
        assert_eq!(failures[0].severity, Severity::Critical);
    }

    #[test]
    fn ci_signal_bumps_and_reorders_import_failures() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.ci_signals.push(crate::types::CiSignal {
            group: "g".into(),
            text: "module not found".into(),
            looks_like_env_or_dependency: true,
        });
        let mut failures = vec![
            Failure::new(FailureType::TestFailure, Severity::Medium, "a.py", 1, 0, "m", "t"),
            Failure::new(FailureType::Import, Severity::High, "b.py", 2, 0, "m", "t"),
        ];
        enrich_with_ci_signals(&mut failures, &state);
        assert_eq!(failures[0].failure_type, FailureType::Import);
        assert_eq!(failures[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn proactive_scan_parses_pipe_delimited_lines() {
        let provider = MockLlmProvider::new(|_system, _user| {
            Ok("RUNTIME|app.py|5|division by zero\n".to_string())
        });
        let found = proactive_llm_scan(&provider, Language::Python, "some ambiguous output").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].failure_type, FailureType::Runtime);
        assert_eq!(found[0].file_path, "app.py");
        assert_eq!(found[0].line, 5);
    }

    #[tokio::test]
    async fn run_classifies_and_orders_from_run_state() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.language = Language::Python;
        state.raw_test_output = "File \"app.py\", line 3\nSyntaxError: invalid syntax".to_string();
        run(&mut state, None).await.unwrap();
        assert_eq!(state.failures.len(), 1);
        assert_eq!(state.failures[0].failure_type, FailureType::Syntax);
    }
}
