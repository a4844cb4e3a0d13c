//! End-to-end coverage of the seed scenarios from spec section 9, driven
//! through the public `run_on_checkout` entry point with scripted
//! subprocess/LLM/git boundaries so no real interpreter, network, or git
//! binary is needed.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use ci_healer::config::HealerConfig;
use ci_healer::git::GitExecutor;
use ci_healer::llm::{LlmError, LlmProvider, MockLlmProvider};
use ci_healer::orchestrator::run_on_checkout;
use ci_healer::progress::RecordingProgressSink;
use ci_healer::stages::test_runner::{CommandOutcome, CommandRunner};
use ci_healer::types::{CiStatus, Language, RunState};

struct ScriptedRunner {
    outcomes: Mutex<Vec<CommandOutcome>>,
}

impl ScriptedRunner {
    fn new(outcomes: Vec<CommandOutcome>) -> Self {
        Self { outcomes: Mutex::new(outcomes) }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _program: &str, _args: &[&str], _cwd: &Path, _timeout: Duration) -> CommandOutcome {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            return CommandOutcome { exit_code: 0, combined_output: "1 passed".into(), duration: 0.01 };
        }
        outcomes.remove(0)
    }
}

struct NoopGitExecutor;

impl GitExecutor for NoopGitExecutor {
    fn execute(&self, _args: &[&str], _cwd: &Path) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

fn outcome(exit_code: i32, output: &str) -> CommandOutcome {
    CommandOutcome { exit_code, combined_output: output.to_string(), duration: 0.05 }
}

fn state_for(dir: &Path, language: Language) -> RunState {
    let mut state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
    state.repo_path = dir.to_path_buf();
    state.language = language;
    state
}

/// S1 — a missing trailing colon is the textbook SYNTAX failure the rule
/// engine fixes without any LLM involvement.
#[tokio::test]
async fn s1_python_missing_colon_resolves_via_rule_engine() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "def subtract(a, b)\n    return a - b\n").unwrap();

    let mut state = state_for(dir.path(), Language::Python);
    let runner = ScriptedRunner::new(vec![
        outcome(1, "File \"app.py\", line 1\nSyntaxError: expected ':'\n1 failed"),
        outcome(0, "1 passed"),
    ]);
    let sink = RecordingProgressSink::new();

    run_on_checkout(&mut state, &HealerConfig::default(), None, &runner, || Box::new(NoopGitExecutor), &sink)
        .await
        .unwrap();

    assert!(matches!(state.ci_status, CiStatus::Resolved));
    assert_eq!(state.fixes.len(), 1);
    assert!(state.fixes[0].deterministic);
    let patched = std::fs::read_to_string(dir.path().join("app.py")).unwrap();
    assert!(patched.lines().next().unwrap().ends_with(':'));
}

/// S2 — a missing `import math` is an IMPORT/RUNTIME failure the rule engine
/// fixes by inserting the stdlib import.
#[tokio::test]
async fn s2_python_missing_import_resolves_via_rule_engine() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "def root(x):\n    return math.sqrt(x)\n").unwrap();

    let mut state = state_for(dir.path(), Language::Python);
    let runner = ScriptedRunner::new(vec![
        outcome(1, "File \"app.py\", line 2\nNameError: name 'math' is not defined\n1 failed"),
        outcome(0, "1 passed"),
    ]);
    let sink = RecordingProgressSink::new();

    run_on_checkout(&mut state, &HealerConfig::default(), None, &runner, || Box::new(NoopGitExecutor), &sink)
        .await
        .unwrap();

    assert!(matches!(state.ci_status, CiStatus::Resolved));
    assert_eq!(state.scoring.actual_fixes, 1);
    let patched = std::fs::read_to_string(dir.path().join("app.py")).unwrap();
    assert_eq!(patched.lines().next().unwrap(), "import math");
}

/// S3 — a Node test failure gets fixed through the LLM path (a mock standing
/// in for the wrong-operator rewrite a real provider would produce).
#[tokio::test]
async fn s3_node_wrong_operator_resolves_via_llm() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("package.json"), "{}").unwrap();
    std::fs::write(dir.path().join("index.js"), "function sub(a, b) {\n  return a + b;\n}\n").unwrap();

    let mut state = state_for(dir.path(), Language::Node);
    state.test_tool = "npm test".to_string();
    let runner = ScriptedRunner::new(vec![
        outcome(
            1,
            "AssertionError: expected 1, got 3\n    at Object.<anonymous> (index.js:2:10)\n1 failed, 0 passed, 1 total",
        ),
        outcome(0, "1 passed, 0 failed, 1 total"),
    ]);
    let provider: Arc<dyn LlmProvider> = Arc::new(MockLlmProvider::new(|_s, _u| {
        Ok("FIX_DESCRIPTION: use subtraction\n```\nfunction sub(a, b) {\n  return a - b;\n}\n```".to_string())
    }));
    let sink = RecordingProgressSink::new();

    run_on_checkout(&mut state, &HealerConfig::default(), Some(provider), &runner, || Box::new(NoopGitExecutor), &sink)
        .await
        .unwrap();

    assert!(matches!(state.ci_status, CiStatus::Resolved | CiStatus::Partial));
    let patched = std::fs::read_to_string(dir.path().join("index.js")).unwrap();
    assert!(patched.contains("a - b"));
}

/// S4 — no test suite to collect (`exit_code == 5`); the rule-engine fix for
/// the collection-blocking syntax error is accepted under the
/// no-tests-collected recovery rule, and the pipeline converges after the
/// first iteration regardless of whether a real suite ever runs.
#[tokio::test]
async fn s4_no_test_suite_converges_after_first_iteration() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "def helper()\n    return 1\n").unwrap();

    let mut state = state_for(dir.path(), Language::Python);
    let runner = ScriptedRunner::new(vec![
        outcome(5, "File \"app.py\", line 1\nSyntaxError: expected ':'\ncollected 0 items\nno tests ran in 0.01s"),
        outcome(0, "1 passed in 0.01s"),
    ]);
    let sink = RecordingProgressSink::new();

    run_on_checkout(&mut state, &HealerConfig::default(), None, &runner, || Box::new(NoopGitExecutor), &sink)
        .await
        .unwrap();

    assert_eq!(state.iteration, 0);
    assert!(matches!(state.ci_status, CiStatus::Resolved));
    assert_eq!(state.fixes.len(), 1);
}

/// S5 — the first LLM call hits a rate limit; the resolver flips
/// `fallback_triggered` permanently and every later stage routes around the
/// provider, still reaching a deterministic terminal status via the rule
/// engine.
#[tokio::test]
async fn s5_llm_quota_exhausted_falls_back_permanently() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "def f()\n    return 1\n").unwrap();

    let mut state = state_for(dir.path(), Language::Python);
    let runner = ScriptedRunner::new(vec![
        outcome(1, "File \"app.py\", line 1\nSyntaxError: expected ':'\n1 failed"),
        outcome(0, "1 passed"),
    ]);
    let provider: Arc<dyn LlmProvider> =
        Arc::new(MockLlmProvider::new(|_s, _u| Err(LlmError::classify("HTTP 429: quota exceeded"))));
    let sink = RecordingProgressSink::new();

    run_on_checkout(&mut state, &HealerConfig::default(), Some(provider), &runner, || Box::new(NoopGitExecutor), &sink)
        .await
        .unwrap();

    assert!(state.fallback_triggered);
    assert!(matches!(state.ci_status, CiStatus::Resolved | CiStatus::Partial));
    assert!(state.fixes.iter().all(|f| f.deterministic));
}

/// S6 — an accepted-looking patch actually regresses a previously passing
/// test; the validator must reject it, restore the original bytes, and the
/// next iteration retries with a cooled temperature.
#[tokio::test]
async fn s6_regressing_patch_is_rolled_back_and_retried_with_lower_temperature() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("app.py");
    let original = "def f()\n    return 1\n";
    std::fs::write(&file, original).unwrap();

    let mut state = state_for(dir.path(), Language::Python);
    state.max_retries = 1;
    let initial_temperature = state.current_temperature;

    // Every test_runner invocation (the iteration's own run, plus one re-run
    // per validated patch) reports the same failing trace: the rule-engine
    // colon fix never actually helps in this fixture, so validation always
    // sees more failures after than before and rejects.
    let runner = ScriptedRunner::new(vec![
        outcome(1, "File \"app.py\", line 1\nSyntaxError: expected ':'\n1 failed"),
        outcome(1, "File \"app.py\", line 1\nSyntaxError: expected ':'\n2 failed"),
        outcome(1, "File \"app.py\", line 1\nSyntaxError: expected ':'\n1 failed"),
        outcome(1, "File \"app.py\", line 1\nSyntaxError: expected ':'\n2 failed"),
    ]);
    let sink = RecordingProgressSink::new();

    run_on_checkout(&mut state, &HealerConfig::default(), None, &runner, || Box::new(NoopGitExecutor), &sink)
        .await
        .unwrap();

    assert!(state.validation_results.iter().any(|v| !v.passed && v.new_failures_introduced >= 1));
    assert_eq!(std::fs::read_to_string(&file).unwrap(), original);
    assert!(state.current_temperature < initial_temperature);
    assert!(matches!(state.ci_status, CiStatus::Failed));
}
