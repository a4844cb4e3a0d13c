//! Stage 3 — Test Runner (spec §4.2): polyglot dispatch to the
//! language-appropriate test tool, normalized into `TestRunResult`.
//!
//! Subprocess execution is abstracted behind `CommandRunner` so tests never
//! shell out — directly mirroring the teacher's `GitExecutor` boundary
//! (`autonomous::branch_manager`) and the async subprocess style of
//! `ota::test_runner::TestRunner::run_rust_tests` (spawn via
//! `tokio::process::Command`, capture merged stdout/stderr, measure wall
//! time with `std::time::Instant`).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::types::{Language, RunState, TestRunResult};

/// Outcome of a single subprocess invocation, pre-interpretation.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub combined_output: String,
    pub duration: f64,
}

/// Abstracts subprocess execution so the test runner is unit-testable
/// without touching the filesystem or a real interpreter.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> CommandOutcome;
}

/// Real runner: spawns via `tokio::process::Command`, enforces `timeout`,
/// and maps a missing binary to exit_code -127 and a timeout to -1 with
/// `raw_output = "TIMEOUT"` (spec §4.2).
pub struct RealCommandRunner;

#[async_trait]
impl CommandRunner for RealCommandRunner {
    async fn run(&self, program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> CommandOutcome {
        let start = Instant::now();
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                CommandOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    combined_output: format!("{stdout}\n{stderr}"),
                    duration: start.elapsed().as_secs_f64(),
                }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => CommandOutcome {
                exit_code: -127,
                combined_output: format!("binary not found: {program}: {e}"),
                duration: start.elapsed().as_secs_f64(),
            },
            Ok(Err(e)) => CommandOutcome {
                exit_code: -1,
                combined_output: format!("failed to execute {program}: {e}"),
                duration: start.elapsed().as_secs_f64(),
            },
            Err(_elapsed) => CommandOutcome {
                exit_code: -1,
                combined_output: "TIMEOUT".to_string(),
                duration: start.elapsed().as_secs_f64(),
            },
        }
    }
}

/// Routes subprocess execution through a disposable Docker container (spec
/// §4.2 sandbox option): mounts the repo read-write at `/repo`, runs there,
/// and enforces the same `timeout` as `RealCommandRunner`. Resource limits
/// are forwarded to `docker run` verbatim when configured.
pub struct DockerCommandRunner {
    pub image: String,
    pub memory_limit: Option<String>,
    pub cpu_quota: Option<String>,
}

impl DockerCommandRunner {
    fn build_args(&self, program: &str, args: &[&str], cwd: &Path) -> Vec<String> {
        let repo_bind = format!("{}:/repo", cwd.display());

        let mut docker_args: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            repo_bind,
            "-w".to_string(),
            "/repo".to_string(),
            "-e".to_string(),
            "CI=true".to_string(),
            "-e".to_string(),
            "PYTHONHASHSEED=42".to_string(),
        ];
        if let Some(mem) = &self.memory_limit {
            docker_args.push("--memory".to_string());
            docker_args.push(mem.clone());
        }
        if let Some(quota) = &self.cpu_quota {
            docker_args.push("--cpu-quota".to_string());
            docker_args.push(quota.clone());
        }
        docker_args.push(self.image.clone());
        docker_args.push(program.to_string());
        docker_args.extend(args.iter().map(|a| a.to_string()));
        docker_args
    }
}

#[async_trait]
impl CommandRunner for DockerCommandRunner {
    async fn run(&self, program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> CommandOutcome {
        let start = Instant::now();
        let docker_args = self.build_args(program, args, cwd);

        let child = tokio::process::Command::new("docker")
            .args(&docker_args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                CommandOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    combined_output: format!("{stdout}\n{stderr}"),
                    duration: start.elapsed().as_secs_f64(),
                }
            }
            Ok(Err(e)) => CommandOutcome {
                exit_code: -1,
                combined_output: format!("docker run failed: {e}"),
                duration: start.elapsed().as_secs_f64(),
            },
            Err(_elapsed) => CommandOutcome {
                exit_code: -1,
                combined_output: "TIMEOUT".to_string(),
                duration: start.elapsed().as_secs_f64(),
            },
        }
    }
}

/// Run the language-appropriate suite and normalize the result (spec §4.2).
pub async fn run_tests(
    runner: &dyn CommandRunner,
    repo_path: &Path,
    language: Language,
    test_tool: &str,
    python_timeout: Duration,
    node_timeout: Duration,
    java_timeout: Duration,
) -> TestRunResult {
    match language {
        Language::Python => run_python(runner, repo_path, python_timeout).await,
        Language::Node => run_node(runner, repo_path, test_tool, node_timeout).await,
        Language::Java => run_java(runner, repo_path, test_tool, java_timeout).await,
        Language::Unknown => TestRunResult {
            exit_code: -1,
            raw_output: "no supported language detected".to_string(),
            runner_name: "none".to_string(),
            ..Default::default()
        },
    }
}

async fn run_python(runner: &dyn CommandRunner, repo_path: &Path, timeout: Duration) -> TestRunResult {
    let report_path = repo_path.join(".report.json");
    let _ = std::fs::remove_file(&report_path);

    let outcome = runner
        .run(
            "pytest",
            &[
                "--tb=short",
                "-q",
                "--json-report",
                "--json-report-file=.report.json",
            ],
            repo_path,
            timeout,
        )
        .await;

    let mut result = TestRunResult {
        exit_code: outcome.exit_code,
        raw_output: outcome.combined_output.clone(),
        duration: outcome.duration,
        runner_name: "pytest".to_string(),
        ..Default::default()
    };

    if outcome.combined_output == "TIMEOUT" {
        return result;
    }

    if let Ok(data) = std::fs::read_to_string(&report_path) {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&data) {
            apply_pytest_json_report(&json, &mut result);
            result.structured_report.insert("pytest".to_string(), json);
            return result;
        }
    }

    scrape_pytest_summary(&outcome.combined_output, &mut result);
    result
}

fn apply_pytest_json_report(json: &serde_json::Value, result: &mut TestRunResult) {
    if let Some(summary) = json.get("summary") {
        result.total = summary.get("total").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        result.passed = summary.get("passed").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        result.failed = summary.get("failed").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        result.errors = summary.get("error").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    }
    if let Some(tests) = json.get("tests").and_then(|v| v.as_array()) {
        for test in tests {
            let outcome = test.get("outcome").and_then(|v| v.as_str()).unwrap_or("");
            if outcome == "failed" || outcome == "error" {
                if let Some(longrepr) = test
                    .get("call")
                    .and_then(|c| c.get("longrepr"))
                    .or_else(|| test.get("longrepr"))
                    .and_then(|v| v.as_str())
                {
                    result.stack_traces.push(longrepr.to_string());
                }
            }
        }
    }
}

fn scrape_pytest_summary(output: &str, result: &mut TestRunResult) {
    // e.g. "3 passed, 1 failed in 0.12s" or "no tests ran in 0.01s"
    let re = Regex::new(r"(\d+)\s+passed").unwrap();
    if let Some(cap) = re.captures(output) {
        result.passed = cap[1].parse().unwrap_or(0);
    }
    let re = Regex::new(r"(\d+)\s+failed").unwrap();
    if let Some(cap) = re.captures(output) {
        result.failed = cap[1].parse().unwrap_or(0);
    }
    let re = Regex::new(r"(\d+)\s+error").unwrap();
    if let Some(cap) = re.captures(output) {
        result.errors = cap[1].parse().unwrap_or(0);
    }
    result.total = result.passed + result.failed + result.errors;
    if output.contains("no tests ran") {
        result.exit_code = 5;
    }
}

async fn run_node(runner: &dyn CommandRunner, repo_path: &Path, test_tool: &str, timeout: Duration) -> TestRunResult {
    let report_path = repo_path.join(".jest_results.json");
    let _ = std::fs::remove_file(&report_path);

    let mut parts = test_tool.split_whitespace();
    let program = parts.next().unwrap_or("npm");
    let mut args: Vec<&str> = parts.collect();
    let extra = [
        "--",
        "--json",
        "--outputFile=.jest_results.json",
        "--forceExit",
        "--passWithNoTests",
    ];
    args.extend_from_slice(&extra);

    let outcome = runner.run(program, &args, repo_path, timeout).await;

    let mut result = TestRunResult {
        exit_code: outcome.exit_code,
        raw_output: outcome.combined_output.clone(),
        duration: outcome.duration,
        runner_name: program.to_string(),
        ..Default::default()
    };

    if outcome.combined_output == "TIMEOUT" {
        return result;
    }

    if let Ok(data) = std::fs::read_to_string(&report_path) {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&data) {
            apply_jest_json_report(&json, &mut result);
            result.structured_report.insert("jest".to_string(), json);
            return result;
        }
    }

    scrape_node_summary(&outcome.combined_output, &mut result);
    result
}

fn apply_jest_json_report(json: &serde_json::Value, result: &mut TestRunResult) {
    result.passed = json.get("numPassedTests").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    result.failed = json.get("numFailedTests").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    result.total = json.get("numTotalTests").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    if let Some(messages) = json.get("failureMessages").and_then(|v| v.as_array()) {
        for m in messages {
            if let Some(s) = m.as_str() {
                result.stack_traces.push(s.to_string());
            }
        }
    }
    if let Some(suites) = json.get("testResults").and_then(|v| v.as_array()) {
        for suite in suites {
            if let Some(msgs) = suite.get("message").and_then(|v| v.as_str()) {
                if !msgs.is_empty() {
                    result.stack_traces.push(msgs.to_string());
                }
            }
        }
    }
}

fn scrape_node_summary(output: &str, result: &mut TestRunResult) {
    // Jest: "Tests:       1 failed, 3 passed, 4 total"
    // Mocha: "3 passing" / "1 failing"
    // Vitest: "Tests  1 failed | 3 passed (4)"
    let re = Regex::new(r"(\d+)\s+(?:passed|passing)").unwrap();
    if let Some(cap) = re.captures(output) {
        result.passed = cap[1].parse().unwrap_or(0);
    }
    let re = Regex::new(r"(\d+)\s+(?:failed|failing)").unwrap();
    if let Some(cap) = re.captures(output) {
        result.failed = cap[1].parse().unwrap_or(0);
    }
    let re = Regex::new(r"(\d+)\s+total").unwrap();
    if let Some(cap) = re.captures(output) {
        result.total = cap[1].parse().unwrap_or(0);
    } else {
        result.total = result.passed + result.failed;
    }
}

async fn run_java(runner: &dyn CommandRunner, repo_path: &Path, test_tool: &str, timeout: Duration) -> TestRunResult {
    let uses_maven = test_tool.starts_with("mvn");
    let wrapper = if uses_maven { "mvnw" } else { "gradlew" };
    let program = if repo_path.join(wrapper).exists() {
        format!("./{wrapper}")
    } else if uses_maven {
        "mvn".to_string()
    } else {
        "gradle".to_string()
    };
    let args: Vec<&str> = vec!["test"];

    let outcome = runner.run(&program, &args, repo_path, timeout).await;

    let mut result = TestRunResult {
        exit_code: outcome.exit_code,
        raw_output: outcome.combined_output.clone(),
        duration: outcome.duration,
        runner_name: program.clone(),
        ..Default::default()
    };

    if outcome.combined_output == "TIMEOUT" {
        return result;
    }

    let surefire_dirs = find_surefire_dirs(repo_path);
    let mut found_xml = false;
    for dir in surefire_dirs {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("xml") {
                    if let Ok(xml) = std::fs::read_to_string(&path) {
                        if apply_surefire_xml(&xml, &mut result) {
                            found_xml = true;
                        }
                    }
                }
            }
        }
    }

    if !found_xml {
        scrape_java_summary(&outcome.combined_output, &mut result);
    }

    result
}

fn find_surefire_dirs(repo_path: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for entry in ignore::WalkBuilder::new(repo_path).hidden(false).build().flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
            && entry.file_name() == "surefire-reports"
        {
            dirs.push(entry.into_path());
        }
    }
    dirs
}

/// Parse a single Surefire XML report via `quick-xml`, accumulating counts
/// and failure/error message text. Returns whether the file was recognized.
fn apply_surefire_xml(xml: &str, result: &mut TestRunResult) -> bool {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut saw_testsuite = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = e.name();
                let local = String::from_utf8_lossy(name.as_ref()).to_string();
                if local == "testsuite" {
                    saw_testsuite = true;
                    for attr in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr.unescape_value().unwrap_or_default().to_string();
                        let num: u32 = value.parse().unwrap_or(0);
                        match key.as_str() {
                            "tests" => result.total += num,
                            "failures" => result.failed += num,
                            "errors" => result.errors += num,
                            _ => {}
                        }
                    }
                } else if local == "failure" || local == "error" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"message" {
                            let msg = attr.unescape_value().unwrap_or_default().to_string();
                            result.stack_traces.push(msg);
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Ok(text) = t.unescape() {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() && result.stack_traces.last().map(|s| s.as_str()) != Some(trimmed) {
                        // Attach body text of <failure>/<error> elements, if any.
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    if saw_testsuite {
        result.passed = result.total.saturating_sub(result.failed + result.errors);
    }
    saw_testsuite
}

fn scrape_java_summary(output: &str, result: &mut TestRunResult) {
    // "Tests run: 10, Failures: 2, Errors: 1, Skipped: 0"
    let re = Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+),\s*Errors:\s*(\d+)").unwrap();
    if let Some(cap) = re.captures(output) {
        result.total = cap[1].parse().unwrap_or(0);
        result.failed = cap[2].parse().unwrap_or(0);
        result.errors = cap[3].parse().unwrap_or(0);
        result.passed = result.total.saturating_sub(result.failed + result.errors);
    }
}

/// Stage entry point.
pub async fn run(state: &mut RunState, runner: &dyn CommandRunner, cfg: &crate::config::HealerConfig) -> Result<()> {
    let started = Instant::now();
    let before = state.failures.len() as u32;

    let result = run_tests(
        runner,
        &state.repo_path,
        state.language,
        &state.test_tool,
        cfg.python_test_timeout,
        cfg.node_test_timeout,
        cfg.java_test_timeout,
    )
    .await;

    state.test_exit_code = result.exit_code;
    state.raw_test_output = result.raw_output.clone();
    state.structured_test_report = result.structured_report.clone();
    state.stack_traces = result.stack_traces.clone();

    let description = format!(
        "Ran {} — {} passed, {} failed, {} errors (exit {})",
        result.runner_name, result.passed, result.failed, result.errors, result.exit_code
    );
    tracing::info!(run_id = %state.run_id, exit_code = result.exit_code, "test run complete");
    state.push_event(
        "TESTS_RUN",
        description,
        before,
        before,
        started.elapsed().as_secs_f64(),
    );

    Ok(())
}
