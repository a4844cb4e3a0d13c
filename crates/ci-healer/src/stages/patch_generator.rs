//! Stage 6 — Patch Generator (spec §4.5).
//!
//! LLM-primary: build a per-file prompt with a ±30-line window around the
//! root-cause location, ask for a `FIX_DESCRIPTION:` line followed by a
//! fenced replacement block, and extract the LAST fenced block in the
//! response (models sometimes think out loud in earlier fences). Falls back
//! permanently to the deterministic rule engine (`stages::rules`) once
//! `RunState.fallback_triggered` is set by the Resolver or by a rate limit
//! observed here.

use crate::config::HealerConfig;
use crate::llm::{LlmError, LlmProvider};
use crate::stages::rules;
use crate::types::{Failure, Patch, RunState};

const WIDE_WINDOW: u32 = 30;
const PROMPT_SIZE_THRESHOLD: usize = 12_000;

fn read_full(repo_path: &std::path::Path, rel_file: &str) -> Option<String> {
    std::fs::read_to_string(repo_path.join(rel_file)).ok()
}

fn window_around(source: &str, line: u32, window: u32) -> (String, u32, u32) {
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() {
        return (String::new(), 1, 1);
    }
    let center = line.saturating_sub(1) as usize;
    let start = center.saturating_sub(window as usize);
    let end = (center + window as usize).min(lines.len() - 1);
    (lines[start..=end].join("\n"), start as u32 + 1, end as u32 + 1)
}

fn build_prompt(state: &RunState, failure: &Failure, full_source: &str) -> String {
    let root_line = failure.root_cause_line.unwrap_or(failure.line);
    let window = if full_source.len() > PROMPT_SIZE_THRESHOLD { WIDE_WINDOW } else { WIDE_WINDOW * 2 };
    let (snippet, start, end) = window_around(full_source, root_line, window);

    format!(
        "You are fixing a {lang} test failure.\n\
         failure_type={ftype:?}\n\
         file={file}\n\
         message: {msg}\n\n\
         Lines {start}-{end} of {file}:\n{snippet}\n\n\
         Reply with exactly:\n\
         FIX_DESCRIPTION: <one line describing the fix>\n\
         ```\n\
         <the complete corrected file content>\n\
         ```",
        lang = state.language,
        ftype = failure.failure_type,
        file = failure.file_path,
        msg = failure.message,
    )
}

/// Extract the LAST fenced code block and the `FIX_DESCRIPTION:` line from
/// an LLM response (spec §4.5).
fn parse_response(response: &str) -> Option<(String, String)> {
    let description = response
        .lines()
        .find_map(|l| l.strip_prefix("FIX_DESCRIPTION:"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "Applied LLM-generated fix".to_string());

    let mut fences: Vec<usize> = Vec::new();
    for (i, line) in response.lines().enumerate() {
        if line.trim_start().starts_with("```") {
            fences.push(i);
        }
    }
    if fences.len() < 2 {
        return None;
    }
    let last_close = fences[fences.len() - 1];
    let last_open = fences[fences.len() - 2];
    let lines: Vec<&str> = response.lines().collect();
    let body = lines[last_open + 1..last_close].join("\n");
    Some((description, body))
}

/// Heuristic Python-parse-validity gate: reject obviously truncated or
/// unbalanced patches before they reach validation (spec §4.5).
fn looks_parseable(language: crate::types::Language, patched: &str) -> bool {
    if patched.trim().is_empty() {
        return false;
    }
    if language == crate::types::Language::Python {
        let opens = patched.matches('(').count() + patched.matches('[').count() + patched.matches('{').count();
        let closes = patched.matches(')').count() + patched.matches(']').count() + patched.matches('}').count();
        if opens != closes {
            return false;
        }
    }
    true
}

async fn generate_with_llm(
    llm: &dyn LlmProvider,
    state: &RunState,
    failure: &Failure,
) -> Result<Option<Patch>, LlmError> {
    let Some(full_source) = read_full(&state.repo_path, &failure.file_path) else {
        return Ok(None);
    };
    let prompt = build_prompt(state, failure, &full_source);
    let response = llm.generate(&prompt, state.current_temperature).await?;

    let Some((description, patched)) = parse_response(&response) else {
        return Ok(None);
    };

    if !looks_parseable(state.language, &patched) {
        tracing::warn!(file = %failure.file_path, "LLM patch failed parseability gate, discarding");
        return Ok(None);
    }

    let patch = Patch::new(failure, &failure.file_path, full_source, patched, description, false);
    Ok(Some(patch))
}

fn generate_with_rules(failure: &Failure, repo_path: &std::path::Path) -> Option<Patch> {
    let full_source = read_full(repo_path, &failure.file_path)?;
    let (original, patched) = rules::apply(failure, &full_source)?;
    Some(Patch::new(
        failure,
        &failure.file_path,
        original,
        patched,
        "Applied deterministic rule-engine fix",
        true,
    ))
}

/// Stage entry point: produces zero or one `Patch` per failure, appended to
/// `RunState.patches`.
pub async fn run(
    state: &mut RunState,
    llm: Option<&dyn LlmProvider>,
    cfg: &HealerConfig,
) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let before = state.failures.len() as u32;

    let failures = state.failures.clone();
    let mut patches = Vec::new();

    for failure in &failures {
        let use_llm = llm.is_some() && !state.fallback_triggered;
        let patch = if use_llm {
            match generate_with_llm(llm.unwrap(), state, failure).await {
                Ok(Some(mut patch)) => {
                    if patch.changed_line_count() > cfg.patch_max_lines {
                        None
                    } else {
                        patch.validated = false;
                        Some(patch)
                    }
                }
                Ok(None) => generate_with_rules(failure, &state.repo_path),
                Err(LlmError::RateLimited(reason)) => {
                    tracing::warn!(reason = %reason, "LLM rate limited during patch generation, falling back permanently");
                    state.fallback_triggered = true;
                    generate_with_rules(failure, &state.repo_path)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "LLM patch generation failed, falling back for this failure");
                    generate_with_rules(failure, &state.repo_path)
                }
            }
        } else {
            generate_with_rules(failure, &state.repo_path)
        };

        if let Some(patch) = patch {
            patches.push(patch);
        }
    }

    let produced = patches.len() as u32;
    state.patches_generated = produced;
    state.patches.extend(patches);

    tracing::info!(run_id = %state.run_id, produced, "patches generated");
    state.push_event(
        "PATCHES_GENERATED",
        format!("Generated {produced} patch(es)"),
        before,
        before,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}
