//! Stage 9 — Scorer (spec §4.8): resolves the terminal `CiStatus` and
//! computes the deterministic final score.

use crate::types::{CiStatus, RunState, Scoring};

const SPEED_BONUS_THRESHOLD_SECONDS: f64 = 300.0;
const SPEED_BONUS: f64 = 10.0;
const EFFICIENCY_PENALTY_FREE_FIXES: u32 = 20;
const EFFICIENCY_PENALTY_PER_EXCESS_FIX: f64 = 2.0;
const REGRESSION_PENALTY_PER_TEST: f64 = 5.0;
const BASE_SCORE: f64 = 100.0;

fn resolve_ci_status(state: &RunState) -> CiStatus {
    if state.fatal_error.is_some() {
        return CiStatus::Failed;
    }
    // Vacuously true when no failure was ever detected — a clean run is a
    // success, not a failure to find something to fix.
    if state.unfixed_failures().is_empty() {
        return CiStatus::Resolved;
    }
    if !state.fixes.is_empty() && state.test_exit_code == 5 {
        return CiStatus::Resolved;
    }
    if !state.fixes.is_empty() {
        return CiStatus::Partial;
    }
    CiStatus::Failed
}

fn regressed_test_count(state: &RunState) -> u32 {
    state
        .validation_results
        .iter()
        .map(|v| v.new_failures_introduced)
        .sum()
}

fn compute_scoring(state: &RunState, elapsed_seconds: f64) -> Scoring {
    let accepted_fix_count = state.fixes.len() as u32;
    let speed_factor = if elapsed_seconds < SPEED_BONUS_THRESHOLD_SECONDS { SPEED_BONUS } else { 0.0 };

    let excess_fixes = accepted_fix_count.saturating_sub(EFFICIENCY_PENALTY_FREE_FIXES);
    let efficiency_penalty = EFFICIENCY_PENALTY_PER_EXCESS_FIX * excess_fixes as f64;

    let regressed = regressed_test_count(state);
    let regression_penalty = efficiency_penalty + REGRESSION_PENALTY_PER_TEST * regressed as f64;

    let ci_success_score = match resolve_ci_status(state) {
        CiStatus::Resolved => BASE_SCORE,
        CiStatus::Partial => BASE_SCORE / 2.0,
        _ => 0.0,
    };

    let total_score = (BASE_SCORE + speed_factor - regression_penalty).max(0.0);

    Scoring {
        base_score: BASE_SCORE,
        speed_factor,
        fix_efficiency: accepted_fix_count as f64,
        regression_penalty,
        ci_success_score,
        total_score,
        iterations_used: state.iteration,
        total_possible_fixes: state.failures.len() as u32,
        actual_fixes: accepted_fix_count,
    }
}

/// Stage entry point.
pub fn run(state: &mut RunState) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    let before = state.failures.len() as u32;

    let elapsed = state.elapsed_seconds();
    state.ci_status = resolve_ci_status(state);
    state.scoring = compute_scoring(state, elapsed);

    tracing::info!(
        run_id = %state.run_id,
        ci_status = %state.ci_status,
        score = state.scoring.total_score,
        "run scored"
    );
    state.push_event(
        "RUN_SCORED",
        format!(
            "Final status {} with score {:.1}",
            state.ci_status, state.scoring.total_score
        ),
        before,
        before,
        started.elapsed().as_secs_f64(),
    );
    Ok(())
}
