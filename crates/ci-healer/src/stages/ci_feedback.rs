//! Stage 1 — CI Feedback Parser (spec §2, §4.3 "CI-log enrichment").
//!
//! Ingests optional prior CI log text and tags failure hints by splitting it
//! into `##[group]`/`##[error]` blocks (the GitHub Actions annotation
//! format). Downstream, the Classifier consults `RunState.ci_signals` to
//! decide whether to bump IMPORT/DEPENDENCY failures to CRITICAL.

use regex::Regex;

use crate::types::{CiSignal, RunState};

const ENV_OR_DEPENDENCY_HINTS: &[&str] = &[
    "module not found",
    "cannot find module",
    "no matching distribution",
    "could not resolve dependency",
    "package not found",
    "unable to resolve dependency",
    "modulenotfounderror",
    "npm err!",
    "could not find or load main class",
    "dependency resolution failed",
];

/// Parse `##[group]name` ... `##[endgroup]` blocks and any standalone
/// `##[error]message` lines out of a raw GitHub Actions log.
pub fn parse_ci_log(log_text: &str) -> Vec<CiSignal> {
    let mut signals = Vec::new();

    let group_re = Regex::new(r"(?s)##\[group\](?P<name>[^\n]*)\n(?P<body>.*?)##\[endgroup\]")
        .expect("valid regex");
    for cap in group_re.captures_iter(log_text) {
        let name = cap["name"].trim().to_string();
        let body = cap["body"].trim().to_string();
        let looks_like_env = looks_like_env_or_dependency(&name) || looks_like_env_or_dependency(&body);
        signals.push(CiSignal {
            group: name,
            text: body,
            looks_like_env_or_dependency: looks_like_env,
        });
    }

    let error_re = Regex::new(r"##\[error\](?P<msg>[^\n]*)").expect("valid regex");
    for cap in error_re.captures_iter(log_text) {
        let msg = cap["msg"].trim().to_string();
        signals.push(CiSignal {
            group: "error".to_string(),
            looks_like_env_or_dependency: looks_like_env_or_dependency(&msg),
            text: msg,
        });
    }

    signals
}

fn looks_like_env_or_dependency(text: &str) -> bool {
    let lower = text.to_lowercase();
    ENV_OR_DEPENDENCY_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Stage entry point: tags `RunState.ci_signals` from `RunState.ci_log_text`.
pub fn run(state: &mut RunState) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let before = state.failures.len() as u32;

    let signals = match &state.ci_log_text {
        Some(log) if !log.trim().is_empty() => parse_ci_log(log),
        _ => Vec::new(),
    };

    let description = if signals.is_empty() {
        "No prior CI log provided; skipping feedback parsing".to_string()
    } else {
        format!("Parsed {} CI log signal(s) from prior run", signals.len())
    };

    tracing::info!(run_id = %state.run_id, signal_count = signals.len(), "CI feedback parsed");
    state.ci_signals = signals;
    state.push_event(
        "CI_FEEDBACK_PARSED",
        description,
        before,
        before,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_and_error_blocks() {
        let log = "\
##[group]Run npm test
some setup output
ModuleNotFoundError: No module named 'requests'
##[endgroup]
##[error]Process completed with exit code 1.
";
        let signals = parse_ci_log(log);
        assert_eq!(signals.len(), 2);
        assert!(signals[0].looks_like_env_or_dependency);
        assert_eq!(signals[1].group, "error");
    }

    #[test]
    fn empty_log_yields_no_signals() {
        assert!(parse_ci_log("").is_empty());
    }

    #[test]
    fn stage_run_handles_missing_log() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.ci_log_text = None;
        run(&mut state).unwrap();
        assert!(state.ci_signals.is_empty());
        assert_eq!(state.timeline.len(), 1);
    }
}
