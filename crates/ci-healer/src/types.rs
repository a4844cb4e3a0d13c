//! Shared data model — the single `RunState` threaded through every pipeline
//! stage, plus the records it accumulates (`Failure`, `Patch`,
//! `ValidationResult`, `Fix`, `TimelineEvent`, `Scoring`).
//!
//! Enum values serialize as their canonical string names (spec invariant g):
//! every enum here derives `Serialize`/`Deserialize` with
//! `#[serde(rename_all = "SCREAMING_SNAKE_CASE")]` or an explicit `Display`
//! matching the spec's wire vocabulary.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Detected project language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    Python,
    Node,
    Java,
    Unknown,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Language::Python => "PYTHON",
            Language::Node => "NODE",
            Language::Java => "JAVA",
            Language::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Classification of a single failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Syntax,
    Indentation,
    Import,
    Dependency,
    TypeError,
    Runtime,
    TestFailure,
    Logic,
    Linting,
    Unknown,
}

/// Severity, ordered CRITICAL > HIGH > MEDIUM > LOW (spec §4.3 rule 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    // Declared Low..Critical so the derived `Ord` sorts ascending by
    // importance; call sites sort with `.rev()` / `Reverse` to get
    // CRITICAL-first ordering (see `stages::classifier::order_failures`).
    Low,
    Medium,
    High,
    Critical,
}

/// Terminal CI status resolved by the Scorer and reported on the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "PARTIAL")]
    Partial,
    #[serde(rename = "RESOLVED")]
    Resolved,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CiStatus::Pending => "PENDING",
            CiStatus::InProgress => "IN_PROGRESS",
            CiStatus::Partial => "PARTIAL",
            CiStatus::Resolved => "RESOLVED",
            CiStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A structured, classified test or static-analysis problem (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub failure_id: String,
    pub failure_type: FailureType,
    pub severity: Severity,
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub raw_trace: String,
    pub test_name: Option<String>,
    pub root_cause_file: Option<String>,
    pub root_cause_line: Option<u32>,
}

impl Failure {
    pub fn new(
        failure_type: FailureType,
        severity: Severity,
        file_path: impl Into<String>,
        line: u32,
        column: u32,
        message: impl Into<String>,
        raw_trace: impl Into<String>,
    ) -> Self {
        Self {
            failure_id: uuid::Uuid::new_v4().to_string(),
            failure_type,
            severity,
            file_path: file_path.into(),
            line,
            column,
            message: message.into(),
            raw_trace: raw_trace.into(),
            test_name: None,
            root_cause_file: None,
            root_cause_line: None,
        }
    }

    /// Dedup key per spec §4.3 rule 6: (type, file, line, message[:80]).
    pub fn dedup_key(&self) -> (FailureType, String, u32, String) {
        let truncated: String = self.message.chars().take(80).collect();
        (self.failure_type, self.file_path.clone(), self.line, truncated)
    }
}

/// A proposed complete file rewrite, not yet accepted (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub patch_id: String,
    pub failure_id: String,
    pub patch_type: FailureType,
    pub file_path: String,
    pub original_code: String,
    pub patched_code: String,
    pub unified_diff: String,
    pub line_start: u32,
    pub line_end: u32,
    pub reasoning: String,
    pub deterministic: bool,
    pub validated: bool,
}

impl Patch {
    pub fn new(
        failure: &Failure,
        file_path: impl Into<String>,
        original_code: String,
        patched_code: String,
        reasoning: impl Into<String>,
        deterministic: bool,
    ) -> Self {
        let file_path = file_path.into();
        let unified_diff = crate::util::diff::unified_diff(&file_path, &original_code, &patched_code);
        Self {
            patch_id: uuid::Uuid::new_v4().to_string(),
            failure_id: failure.failure_id.clone(),
            patch_type: failure.failure_type,
            file_path,
            original_code,
            patched_code,
            unified_diff,
            line_start: failure.line,
            line_end: failure.line,
            reasoning: reasoning.into(),
            deterministic,
            validated: false,
        }
    }

    /// Number of changed lines in the unified diff (for the PATCH_MAX_LINES gate).
    pub fn changed_line_count(&self) -> usize {
        self.unified_diff
            .lines()
            .filter(|l| {
                (l.starts_with('+') && !l.starts_with("+++"))
                    || (l.starts_with('-') && !l.starts_with("---"))
            })
            .count()
    }
}

/// Outcome of applying and re-testing a single `Patch` (spec §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub patch_id: String,
    pub passed: bool,
    pub tests_before: u32,
    pub tests_after: u32,
    pub tests_fixed: u32,
    pub new_failures_introduced: u32,
    pub deterministic: bool,
    pub rejection_reason: Option<String>,
}

/// An accepted, validated patch attached to its originating failure (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fix {
    pub fix_id: String,
    pub failure_id: String,
    pub patch_id: String,
    pub failure_type: FailureType,
    pub file_path: String,
    pub line_number: u32,
    pub description: String,
    pub patch_type: FailureType,
    pub diff: String,
    pub original_code: String,
    pub patched_code: String,
    pub validated: bool,
    pub commit_sha: Option<String>,
}

impl Fix {
    pub fn from_patch(patch: &Patch, failure: &Failure, description: impl Into<String>) -> Self {
        Self {
            fix_id: uuid::Uuid::new_v4().to_string(),
            failure_id: failure.failure_id.clone(),
            patch_id: patch.patch_id.clone(),
            failure_type: failure.failure_type,
            file_path: patch.file_path.clone(),
            line_number: patch.line_start,
            description: description.into(),
            patch_type: patch.patch_type,
            diff: patch.unified_diff.clone(),
            original_code: patch.original_code.clone(),
            patched_code: patch.patched_code.clone(),
            validated: true,
            commit_sha: None,
        }
    }
}

/// A timestamped, human-readable record emitted by a stage (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: String,
    pub iteration: u32,
    pub event_type: String,
    pub description: String,
    pub failures_before: u32,
    pub failures_after: u32,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Deterministic final score (spec §3, §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scoring {
    pub base_score: f64,
    pub speed_factor: f64,
    pub fix_efficiency: f64,
    pub regression_penalty: f64,
    pub ci_success_score: f64,
    pub total_score: f64,
    pub iterations_used: u32,
    pub total_possible_fixes: u32,
    pub actual_fixes: u32,
}

/// Normalized output of a test-runner invocation (spec §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRunResult {
    pub exit_code: i32,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub raw_output: String,
    pub structured_report: HashMap<String, serde_json::Value>,
    pub duration: f64,
    pub stack_traces: Vec<String>,
    pub runner_name: String,
}

/// A CI log signal parsed from `##[group]`/`##[error]` blocks (spec §4.3).
#[derive(Debug, Clone)]
pub struct CiSignal {
    pub group: String,
    pub text: String,
    pub looks_like_env_or_dependency: bool,
}

/// The single mutable record threaded through every pipeline stage (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub repo_url: String,
    pub repo_path: PathBuf,
    pub branch_name: String,

    pub language: Language,
    pub test_tool: String,

    pub source_files: Vec<String>,
    pub test_files: Vec<String>,
    pub config_files: Vec<String>,
    pub dependency_graph: HashMap<String, Vec<String>>,

    pub failures: Vec<Failure>,
    pub patches: Vec<Patch>,
    /// Count of patches the Patch Generator produced this iteration, tracked
    /// independently of `patches` because the Validator drains that list
    /// before the convergence check runs (spec §4.9 needs the pre-drain count).
    pub patches_generated: u32,
    pub validation_results: Vec<ValidationResult>,
    pub fixes: Vec<Fix>,

    pub raw_test_output: String,
    pub structured_test_report: HashMap<String, serde_json::Value>,
    pub test_exit_code: i32,
    pub stack_traces: Vec<String>,

    pub iteration: u32,
    pub max_retries: u32,

    pub ci_status: CiStatus,
    pub timeline: Vec<TimelineEvent>,

    pub current_temperature: f64,
    pub temperature_min: f64,
    pub fallback_triggered: bool,
    pub fatal_error: Option<String>,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_time: DateTime<Utc>,

    pub scoring: Scoring,

    /// Optional prior CI log text ingested by the CI Feedback Parser.
    #[serde(skip)]
    pub ci_log_text: Option<String>,
    #[serde(skip)]
    pub ci_signals: Vec<CiSignal>,
}

impl RunState {
    pub fn new(repo_url: impl Into<String>, branch_name: impl Into<String>, run_id: impl Into<String>) -> Self {
        let cfg = crate::config::HealerConfig::from_env();
        Self {
            run_id: run_id.into(),
            repo_url: repo_url.into(),
            repo_path: PathBuf::new(),
            branch_name: branch_name.into(),
            language: Language::Unknown,
            test_tool: String::new(),
            source_files: Vec::new(),
            test_files: Vec::new(),
            config_files: Vec::new(),
            dependency_graph: HashMap::new(),
            failures: Vec::new(),
            patches: Vec::new(),
            patches_generated: 0,
            validation_results: Vec::new(),
            fixes: Vec::new(),
            raw_test_output: String::new(),
            structured_test_report: HashMap::new(),
            test_exit_code: 0,
            stack_traces: Vec::new(),
            iteration: 0,
            max_retries: cfg.max_retries,
            ci_status: CiStatus::Pending,
            timeline: Vec::new(),
            current_temperature: 0.7,
            temperature_min: 0.1,
            fallback_triggered: false,
            fatal_error: None,
            start_time: Utc::now(),
            scoring: Scoring::default(),
            ci_log_text: None,
            ci_signals: Vec::new(),
        }
    }

    /// Append a TimelineEvent; insertion order is wall-clock order (invariant f).
    pub fn push_event(
        &mut self,
        event_type: impl Into<String>,
        description: impl Into<String>,
        failures_before: u32,
        failures_after: u32,
        duration_seconds: f64,
    ) {
        self.timeline.push(TimelineEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            iteration: self.iteration,
            event_type: event_type.into(),
            description: description.into(),
            failures_before,
            failures_after,
            timestamp: Utc::now(),
            duration_seconds,
        });
    }

    /// Failures that do not yet have a corresponding accepted Fix.
    pub fn unfixed_failures(&self) -> Vec<&Failure> {
        let fixed_ids: std::collections::HashSet<&str> =
            self.fixes.iter().map(|f| f.failure_id.as_str()).collect();
        self.failures
            .iter()
            .filter(|f| !fixed_ids.contains(f.failure_id.as_str()))
            .collect()
    }

    pub fn elapsed_seconds(&self) -> f64 {
        (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}
