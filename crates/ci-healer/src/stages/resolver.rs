//! Stage 5 — Root-Cause Resolver (spec §4.4).
//!
//! Groups failures by file and, when an LLM is configured and the pipeline
//! hasn't already fallen back to the rule engine, resolves each group
//! concurrently through a bounded worker pool (mirrors the teacher's
//! `agents::mem0_client` pattern of an optional HTTP-backed capability the
//! caller queries for availability and otherwise routes around). Each
//! resolved failure gets a `root_cause_file`/`root_cause_line` that may
//! differ from its reported location when the true cause is upstream in the
//! dependency graph.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::config::HealerConfig;
use crate::llm::{LlmError, LlmProvider};
use crate::types::{Failure, RunState};

const CONTEXT_WINDOW: u32 = 15;
const MAX_TRANSITIVE_IMPORTS: usize = 10;
const MAX_DEPTH: usize = 2;

/// Resolve the root cause for one failure, given the snippet of its own
/// reported location plus up to `MAX_TRANSITIVE_IMPORTS` lines pulled from
/// its dependency chain (depth-bounded breadth-first walk over
/// `RunState.dependency_graph`).
async fn resolve_one(
    llm: &dyn LlmProvider,
    state: &RunState,
    mut failure: Failure,
) -> (Failure, bool) {
    let snippet = read_window(&state.repo_path, &failure.file_path, failure.line, CONTEXT_WINDOW);
    let context = collect_dependency_context(state, &failure.file_path);

    let prompt = format!(
        "A {lang} test suite reported this failure:\n\
         type={ftype:?} file={file} line={line}\n\
         message: {msg}\n\n\
         Source around the failure:\n{snippet}\n\n\
         Related source from imported modules:\n{context}\n\n\
         Respond with exactly two lines:\n\
         ROOT_CAUSE_FILE: <path>\n\
         ROOT_CAUSE_LINE: <number>",
        lang = state.language,
        ftype = failure.failure_type,
        file = failure.file_path,
        line = failure.line,
        msg = failure.message,
    );

    match llm.generate(&prompt, state.current_temperature).await {
        Ok(response) => {
            if let Some((file, line)) = parse_root_cause(&response) {
                failure.root_cause_file = Some(file);
                failure.root_cause_line = Some(line);
            } else {
                failure.root_cause_file = Some(failure.file_path.clone());
                failure.root_cause_line = Some(failure.line);
            }
            (failure, false)
        }
        Err(LlmError::RateLimited(reason)) => {
            tracing::warn!(reason = %reason, "LLM rate limited during resolution, triggering fallback");
            failure.root_cause_file = Some(failure.file_path.clone());
            failure.root_cause_line = Some(failure.line);
            (failure, true)
        }
        Err(e) => {
            tracing::warn!(error = %e, "LLM resolution failed for failure, falling back to static heuristic");
            static_fallback(state, &mut failure);
            (failure, false)
        }
    }
}

fn parse_root_cause(response: &str) -> Option<(String, u32)> {
    let mut file = None;
    let mut line = None;
    for l in response.lines() {
        if let Some(v) = l.strip_prefix("ROOT_CAUSE_FILE:") {
            file = Some(v.trim().to_string());
        } else if let Some(v) = l.strip_prefix("ROOT_CAUSE_LINE:") {
            line = v.trim().parse().ok();
        }
    }
    match (file, line) {
        (Some(f), Some(l)) => Some((f, l)),
        _ => None,
    }
}

/// Static fallback: strip a leading `test_`/trailing `_test` token from the
/// failing file's stem and probe sibling and `src/` paths for a same-named
/// module (spec §4.4).
fn static_fallback(state: &RunState, failure: &mut Failure) {
    let path = std::path::Path::new(&failure.file_path);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let candidate_stem = stem
        .strip_prefix("test_")
        .or_else(|| stem.strip_suffix("_test"))
        .unwrap_or(stem);

    if candidate_stem == stem {
        failure.root_cause_file = Some(failure.file_path.clone());
        failure.root_cause_line = Some(failure.line);
        return;
    }

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("py");
    let parent = path.parent().unwrap_or_else(|| std::path::Path::new(""));
    let candidates = [
        parent.join(format!("{candidate_stem}.{ext}")),
        parent.join("src").join(format!("{candidate_stem}.{ext}")),
        std::path::PathBuf::from("src").join(format!("{candidate_stem}.{ext}")),
        std::path::PathBuf::from(format!("{candidate_stem}.{ext}")),
    ];

    for candidate in candidates {
        let rel = candidate.to_string_lossy().replace('\\', "/");
        if state.source_files.contains(&rel) {
            failure.root_cause_file = Some(rel);
            failure.root_cause_line = Some(1);
            return;
        }
    }

    failure.root_cause_file = Some(failure.file_path.clone());
    failure.root_cause_line = Some(failure.line);
}

fn read_window(repo_path: &std::path::Path, rel_file: &str, line: u32, window: u32) -> String {
    let Ok(contents) = std::fs::read_to_string(repo_path.join(rel_file)) else {
        return String::new();
    };
    let lines: Vec<&str> = contents.lines().collect();
    let center = line.saturating_sub(1) as usize;
    let start = center.saturating_sub(window as usize);
    let end = (center + window as usize).min(lines.len().saturating_sub(1));
    if lines.is_empty() {
        return String::new();
    }
    lines[start..=end.min(lines.len() - 1)].join("\n")
}

/// Depth-bounded breadth-first walk of the dependency graph, capped at
/// `MAX_TRANSITIVE_IMPORTS` total lines of context (spec §4.4).
fn collect_dependency_context(state: &RunState, file: &str) -> String {
    let mut visited = std::collections::HashSet::new();
    let mut frontier = vec![file.to_string()];
    let mut out = String::new();
    let mut collected = 0usize;

    for _depth in 0..MAX_DEPTH {
        let mut next_frontier = Vec::new();
        for f in &frontier {
            if !visited.insert(f.clone()) {
                continue;
            }
            if let Some(deps) = state.dependency_graph.get(f) {
                for dep in deps {
                    if collected >= MAX_TRANSITIVE_IMPORTS {
                        return out;
                    }
                    if let Ok(contents) = std::fs::read_to_string(state.repo_path.join(dep)) {
                        let snippet: String = contents.lines().take(10).collect::<Vec<_>>().join("\n");
                        out.push_str(&format!("--- {dep} ---\n{snippet}\n"));
                        collected += 1;
                    }
                    next_frontier.push(dep.clone());
                }
            }
        }
        frontier = next_frontier;
        if frontier.is_empty() {
            break;
        }
    }
    out
}

/// Stage entry point.
pub async fn run(state: &mut RunState, llm: Option<Arc<dyn LlmProvider>>, cfg: &HealerConfig) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let before = state.failures.len() as u32;

    let failures = std::mem::take(&mut state.failures);

    let resolved: Vec<(Failure, bool)> = match (&llm, state.fallback_triggered) {
        (Some(provider), false) => {
            let provider = provider.clone();
            let state_ref = &*state;
            stream::iter(failures.into_iter())
                .map(|f| {
                    let provider = provider.clone();
                    async move { resolve_one(provider.as_ref(), state_ref, f).await }
                })
                .buffer_unordered(cfg.resolver_worker_pool)
                .collect()
                .await
        }
        _ => failures
            .into_iter()
            .map(|mut f| {
                static_fallback(state, &mut f);
                (f, false)
            })
            .collect(),
    };

    let mut any_fallback = false;
    let mut final_failures = Vec::with_capacity(resolved.len());
    for (f, triggered) in resolved {
        any_fallback |= triggered;
        final_failures.push(f);
    }
    if any_fallback {
        state.fallback_triggered = true;
    }

    state.failures = final_failures;
    let after = state.failures.len() as u32;

    tracing::info!(run_id = %state.run_id, fallback = state.fallback_triggered, "root causes resolved");
    state.push_event(
        "ROOT_CAUSES_RESOLVED",
        format!("Resolved root causes for {after} failure(s)"),
        before,
        after,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}

/// Group failures by reported file path, preserving discovery order — used
/// by the Patch Generator to batch per-file LLM prompts (spec §4.5).
pub fn group_by_file(failures: &[Failure]) -> HashMap<String, Vec<&Failure>> {
    let mut groups: HashMap<String, Vec<&Failure>> = HashMap::new();
    for f in failures {
        groups.entry(f.file_path.clone()).or_default().push(f);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmProvider;
    use crate::types::{FailureType, Severity};
    use tempfile::tempdir;

    #[test]
    fn static_fallback_strips_test_prefix_and_finds_sibling() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("math_ops.py"), "def add(a, b):\n    return a + b\n").unwrap();
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.repo_path = dir.path().to_path_buf();
        state.source_files = vec!["math_ops.py".to_string()];
        let mut f = Failure::new(FailureType::Logic, Severity::Medium, "test_math_ops.py", 5, 0, "boom", "");
        static_fallback(&state, &mut f);
        assert_eq!(f.root_cause_file.unwrap(), "math_ops.py");
    }

    #[tokio::test]
    async fn rate_limit_error_sets_fallback_flag() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.failures.push(Failure::new(FailureType::Logic, Severity::Medium, "a.py", 1, 0, "m", ""));
        let provider: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::new(|_s, _u| {
            Err(LlmError::classify("HTTP 429: rate limited"))
        }));
        let cfg = HealerConfig::default();
        run(&mut state, Some(provider), &cfg).await.unwrap();
        assert!(state.fallback_triggered);
    }

    #[tokio::test]
    async fn successful_resolution_sets_root_cause_fields() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.failures.push(Failure::new(FailureType::Logic, Severity::Medium, "a.py", 1, 0, "m", ""));
        let provider: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::new(|_s, _u| {
            Ok("ROOT_CAUSE_FILE: b.py\nROOT_CAUSE_LINE: 9".to_string())
        }));
        let cfg = HealerConfig::default();
        run(&mut state, Some(provider), &cfg).await.unwrap();
        assert_eq!(state.failures[0].root_cause_file.as_deref(), Some("b.py"));
        assert_eq!(state.failures[0].root_cause_line, Some(9));
    }

    #[test]
    fn group_by_file_batches_multiple_failures_per_path() {
        let failures = vec![
            Failure::new(FailureType::Syntax, Severity::Critical, "a.py", 1, 0, "m", ""),
            Failure::new(FailureType::Syntax, Severity::Critical, "a.py", 5, 0, "m", ""),
            Failure::new(FailureType::Import, Severity::Critical, "b.py", 2, 0, "m", ""),
        ];
        let groups = group_by_file(&failures);
        assert_eq!(groups.get("a.py").unwrap().len(), 2);
        assert_eq!(groups.get("b.py").unwrap().len(), 1);
    }
}
