//! The convergence-loop driver (spec §2, §5, §7): runs the linear stage
//! sequence once per iteration, decides whether to converge, and if not,
//! cools the LLM temperature and retries from the Test Runner. Mirrors the
//! teacher's `autonomous::mod` top-level save→build→swap→health-check→
//! rollback driver: one outer loop, one `RunState`, a `ProgressSink`
//! notified after every stage, and a single fatal-exception boundary at the
//! very top that the rest of the pipeline is never expected to need.

use std::sync::Arc;

use anyhow::Result;

use crate::artifact::ArtifactWriter;
use crate::config::HealerConfig;
use crate::git::{GitExecutor, GitOps, RealGitExecutor};
use crate::llm::LlmProvider;
use crate::progress::ProgressSink;
use crate::stages::test_runner::{CommandRunner, DockerCommandRunner, RealCommandRunner};
use crate::stages::{ci_feedback, classifier, commit_optimizer, patch_generator, repo_analyzer, resolver, scorer, test_runner, validator};
use crate::types::RunState;

const TEMPERATURE_DECAY: f64 = 0.75;

/// Decide whether the pipeline has converged (spec §7). Returns `Some(reason)`
/// when it has, `None` when another iteration should run.
fn convergence_reason(state: &RunState) -> Option<&'static str> {
    if state.fatal_error.is_some() {
        return Some("fatal error");
    }
    if state.unfixed_failures().is_empty() {
        return Some("all failures fixed");
    }
    if state.test_exit_code == 5 && !state.fixes.is_empty() {
        return Some("no-tests-collected resolved with at least one fix");
    }
    if state.patches_generated == 0 && state.iteration > 0 {
        return Some("no patches produced this iteration");
    }
    if state.iteration >= state.max_retries {
        return Some("max retries reached");
    }
    None
}

/// Runs the full healing pipeline end to end against an already-cloned
/// repository. `run_healing` (below) wraps this with the clone step.
pub async fn run_on_checkout(
    state: &mut RunState,
    cfg: &HealerConfig,
    llm: Option<Arc<dyn LlmProvider>>,
    command_runner: &dyn CommandRunner,
    git_executor_factory: impl Fn() -> Box<dyn GitExecutor>,
    progress: &dyn ProgressSink,
) -> Result<()> {
    let outcome = run_inner(state, cfg, llm, command_runner, &git_executor_factory, progress).await;

    if let Err(e) = outcome {
        tracing::error!(run_id = %state.run_id, error = %e, "pipeline failed with a fatal error");
        state.fatal_error = Some(e.to_string());
        state.ci_status = crate::types::CiStatus::Failed;
        progress.on_progress(state);
        return Err(e);
    }

    Ok(())
}

async fn run_inner(
    state: &mut RunState,
    cfg: &HealerConfig,
    llm: Option<Arc<dyn LlmProvider>>,
    command_runner: &dyn CommandRunner,
    git_executor_factory: &impl Fn() -> Box<dyn GitExecutor>,
    progress: &dyn ProgressSink,
) -> Result<()> {
    ci_feedback::run(state)?;
    progress.on_progress(state);

    repo_analyzer::run(state)?;
    progress.on_progress(state);

    state.ci_status = crate::types::CiStatus::InProgress;

    loop {
        test_runner::run(state, command_runner, cfg).await?;
        progress.on_progress(state);

        classifier::run(state, llm.as_deref()).await?;
        progress.on_progress(state);

        resolver::run(state, llm.clone(), cfg).await?;
        progress.on_progress(state);

        let active_llm = if state.fallback_triggered { None } else { llm.as_deref() };
        patch_generator::run(state, active_llm, cfg).await?;
        progress.on_progress(state);

        validator::run(state, command_runner, cfg).await?;
        progress.on_progress(state);

        commit_optimizer::run(state, git_executor_factory())?;
        progress.on_progress(state);

        if let Some(reason) = convergence_reason(state) {
            tracing::info!(run_id = %state.run_id, reason, "pipeline converged");
            break;
        }

        state.iteration += 1;
        state.current_temperature = (state.current_temperature * TEMPERATURE_DECAY).max(state.temperature_min);
        state.patches.clear();
    }

    scorer::run(state)?;
    progress.on_progress(state);

    Ok(())
}

/// Public entry point (spec §2): clone `repo_url`, create/check out
/// `branch_name`, run the full healing pipeline, and write the final result
/// artifact. Uses real subprocess git, the real test runner, and whatever
/// LLM provider `cfg` selects.
pub async fn run_healing(repo_url: &str, branch_name: &str, run_id: &str) -> Result<RunState> {
    let cfg = HealerConfig::from_env();
    let mut state = RunState::new(repo_url, branch_name, run_id);
    state.repo_path = cfg.workspace_dir.join(run_id);

    let mut clone_ops = GitOps::new(state.repo_path.clone());
    clone_ops
        .clone(repo_url, &state.repo_path)
        .map_err(|e| crate::error::HealerError::CloneFailed(e.to_string()))?;

    let llm = crate::llm::build_provider(&cfg).map(|p| -> Arc<dyn LlmProvider> { Arc::from(p) });
    let command_runner: Box<dyn CommandRunner> = if cfg.use_docker_sandbox {
        Box::new(DockerCommandRunner {
            image: cfg.sandbox_docker_image.clone(),
            memory_limit: cfg.sandbox_memory_limit.clone(),
            cpu_quota: cfg.sandbox_cpu_quota.clone(),
        })
    } else {
        Box::new(RealCommandRunner)
    };
    let artifact_writer = ArtifactWriter::new(cfg.results_dir.clone());
    let sink = crate::artifact::ArtifactProgressSink::new(cfg.results_dir.clone());

    let result = run_on_checkout(
        &mut state,
        &cfg,
        llm,
        command_runner.as_ref(),
        || Box::new(RealGitExecutor),
        &sink,
    )
    .await;

    artifact_writer.write(&state)?;

    result.map(|_| state.clone()).or_else(|e| {
        if state.fatal_error.is_some() {
            Ok(state.clone())
        } else {
            Err(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmProvider;
    use crate::progress::RecordingProgressSink;
    use crate::stages::test_runner::CommandOutcome;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FixtureRunner;

    #[async_trait::async_trait]
    impl CommandRunner for FixtureRunner {
        async fn run(&self, _p: &str, _a: &[&str], cwd: &Path, _t: Duration) -> CommandOutcome {
            let has_bug = std::fs::read_to_string(cwd.join("app.py"))
                .map(|s| s.contains("def f()\n"))
                .unwrap_or(false);
            if has_bug {
                CommandOutcome {
                    exit_code: 1,
                    combined_output: "File \"app.py\", line 1\nSyntaxError: expected ':'\n1 failed".into(),
                    duration: 0.1,
                }
            } else {
                CommandOutcome { exit_code: 0, combined_output: "1 passed".into(), duration: 0.1 }
            }
        }
    }

    struct NoopGitExecutor;
    impl GitExecutor for NoopGitExecutor {
        fn execute(&self, _args: &[&str], _cwd: &Path) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn pipeline_converges_when_llm_fix_resolves_failure() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "").unwrap();
        std::fs::write(dir.path().join("app.py"), "def f()\n    return 1\n").unwrap();

        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.repo_path = dir.path().to_path_buf();

        let cfg = HealerConfig::default();
        let provider: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::new(|_s, _u| {
            Ok("FIX_DESCRIPTION: add colon\n```\ndef f():\n    return 1\n```".to_string())
        }));
        let runner = FixtureRunner;
        let sink = RecordingProgressSink::new();

        run_on_checkout(
            &mut state,
            &cfg,
            Some(provider),
            &runner,
            || Box::new(NoopGitExecutor),
            &sink,
        )
        .await
        .unwrap();

        assert!(matches!(state.ci_status, crate::types::CiStatus::Resolved | crate::types::CiStatus::Partial));
        assert!(sink.count() > 0);
    }

    #[test]
    fn convergence_reason_detects_max_retries() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.failures.push(crate::types::Failure::new(
            crate::types::FailureType::Syntax,
            crate::types::Severity::Critical,
            "a.py",
            1,
            0,
            "m",
            "",
        ));
        state.patches_generated = 1;
        state.iteration = state.max_retries;
        assert_eq!(convergence_reason(&state), Some("max retries reached"));
    }

    #[test]
    fn convergence_reason_none_when_patches_pending_and_under_limit() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        let failure = crate::types::Failure::new(crate::types::FailureType::Syntax, crate::types::Severity::Critical, "a.py", 1, 0, "m", "");
        state.failures.push(failure.clone());
        state.patches_generated = 1;
        state.patches.push(crate::types::Patch::new(&failure, "a.py", "old".into(), "new".into(), "fix", true));
        assert_eq!(convergence_reason(&state), None);
    }

    #[test]
    fn convergence_reason_fires_when_no_patches_produced_after_first_iteration() {
        let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        state.failures.push(crate::types::Failure::new(
            crate::types::FailureType::Syntax,
            crate::types::Severity::Critical,
            "a.py",
            1,
            0,
            "m",
            "",
        ));
        state.iteration = 1;
        assert_eq!(convergence_reason(&state), Some("no patches produced this iteration"));
    }
}
