//! Stage 8 — Commit Optimizer (spec §4.7).
//!
//! Checks out `RunState.branch_name`, commits each accepted `Fix`
//! individually (sorted by failure type then file path, for a readable
//! commit history), with a synthetic author identity and an
//! `[AI-AGENT]`-prefixed message naming the failure type, path, line, and a
//! short description. Pushes with an injected credential when
//! `GITHUB_TOKEN` is configured and the remote isn't a local path.

use crate::git::{GitExecutor, GitOps};
use crate::types::{Fix, RunState};

fn commit_message(fix: &Fix) -> String {
    format!(
        "[AI-AGENT] {} {}:{} {}",
        failure_type_label(fix.failure_type),
        fix.file_path,
        fix.line_number,
        fix.description
    )
}

fn failure_type_label(t: crate::types::FailureType) -> &'static str {
    use crate::types::FailureType::*;
    match t {
        Syntax => "SYNTAX",
        Indentation => "INDENTATION",
        Import => "IMPORT",
        Dependency => "DEPENDENCY",
        TypeError => "TYPE_ERROR",
        Runtime => "RUNTIME",
        TestFailure => "TEST_FAILURE",
        Logic => "LOGIC",
        Linting => "LINTING",
        Unknown => "UNKNOWN",
    }
}

fn sorted_fix_indices(fixes: &[Fix]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..fixes.len()).collect();
    indices.sort_by(|&a, &b| {
        let fa = &fixes[a];
        let fb = &fixes[b];
        failure_type_label(fa.failure_type)
            .cmp(failure_type_label(fb.failure_type))
            .then_with(|| fa.file_path.cmp(&fb.file_path))
    });
    indices
}

/// Stage entry point.
pub fn run(state: &mut RunState, executor: Box<dyn GitExecutor>) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let before = state.fixes.len() as u32;

    if state.fixes.is_empty() {
        state.push_event(
            "COMMITS_SKIPPED",
            "No accepted fixes to commit".to_string(),
            before,
            before,
            started.elapsed().as_secs_f64(),
        );
        return Ok(());
    }

    let mut ops = GitOps::with_executor(state.repo_path.clone(), executor);
    ops.checkout_or_create_branch(&state.branch_name)?;

    let indices = sorted_fix_indices(&state.fixes);
    let mut committed = 0u32;

    for idx in indices {
        let message = commit_message(&state.fixes[idx]);
        let file_path = state.fixes[idx].file_path.clone();
        ops.stage(&file_path)?;
        match ops.commit(&message) {
            Ok(sha) => {
                state.fixes[idx].commit_sha = Some(sha);
                committed += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, file = %file_path, "failed to commit fix");
            }
        }
    }

    let cfg = crate::config::HealerConfig::from_env();
    if let Some(token) = &cfg.github_token {
        if let Err(e) = ops.push_with_credential(&state.branch_name, token) {
            tracing::warn!(error = %e, "failed to push healed branch");
        }
    } else {
        tracing::info!("GITHUB_TOKEN not configured; leaving fixes committed locally");
    }

    tracing::info!(run_id = %state.run_id, committed, "fixes committed");
    state.push_event(
        "FIXES_COMMITTED",
        format!("Committed {committed} fix(es) to '{}'", state.branch_name),
        before,
        before,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}
