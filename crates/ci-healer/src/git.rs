//! Git/VCS boundary (spec §6, §4.7): clone, branch create/checkout, stage,
//! commit, force-push, with credential injection into the remote URL.
//!
//! Grounded directly on the teacher's `autonomous::branch_manager`: a
//! `GitExecutor` trait wrapping subprocess `git`/`gh` invocations, with a
//! `RealGitExecutor` for production and a mock for tests. Extended here with
//! clone and remote-URL credential rewrite/restore, which the teacher's
//! branch manager (operating on an already-cloned repo) doesn't need.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Result of a single git operation, for audit/timeline purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitOpResult {
    pub success: bool,
    pub description: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

impl GitOpResult {
    pub fn ok(description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            success: true,
            description: description.into(),
            command: command.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn fail(description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            success: false,
            description: description.into(),
            command: command.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Trait for executing git commands — allows mocking in tests (directly
/// mirrors `autonomous::branch_manager::GitExecutor`).
pub trait GitExecutor: Send + Sync {
    fn execute(&self, args: &[&str], cwd: &Path) -> Result<String>;
}

/// Real git executor that runs git commands via subprocess, with explicit
/// terminal/askpass environment variables set so a missing credential never
/// blocks on an interactive prompt (spec §4.7).
pub struct RealGitExecutor;

impl GitExecutor for RealGitExecutor {
    fn execute(&self, args: &[&str], cwd: &Path) -> Result<String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "true")
            .env("GCM_INTERACTIVE", "Never")
            .output()
            .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            bail!("git {} failed: {}", args.join(" "), stderr)
        }
    }
}

/// Wraps `GitExecutor` with the higher-level operations the healer needs:
/// clone, branch management, commit, and credentialed push.
pub struct GitOps {
    repo_path: PathBuf,
    executor: Box<dyn GitExecutor>,
    history: Vec<GitOpResult>,
}

impl GitOps {
    pub fn new(repo_path: PathBuf) -> Self {
        Self {
            repo_path,
            executor: Box::new(RealGitExecutor),
            history: Vec::new(),
        }
    }

    pub fn with_executor(repo_path: PathBuf, executor: Box<dyn GitExecutor>) -> Self {
        Self {
            repo_path,
            executor,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[GitOpResult] {
        &self.history
    }

    fn record(&mut self, result: Result<String>, description: String, command: String) -> Result<String> {
        match result {
            Ok(out) => {
                info!(%command, "git operation succeeded");
                self.history.push(GitOpResult::ok(&description, &command));
                Ok(out)
            }
            Err(e) => {
                warn!(%command, error = %e, "git operation failed");
                self.history.push(GitOpResult::fail(format!("{description}: {e}"), &command));
                Err(e)
            }
        }
    }

    /// Clone `repo_url` into `dest`. Idempotent-ish: fails if `dest` is
    /// non-empty, matching plain `git clone` semantics.
    pub fn clone(&mut self, repo_url: &str, dest: &Path) -> Result<()> {
        let cmd = format!("git clone {repo_url} {}", dest.display());
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).ok();
        let args = vec!["clone", repo_url, dest.to_str().unwrap_or_default()];
        self.record(
            self.executor.execute(&args, parent),
            format!("Cloned {repo_url}"),
            cmd,
        )?;
        Ok(())
    }

    /// Create `branch_name` if it doesn't exist, otherwise check it out.
    pub fn checkout_or_create_branch(&mut self, branch_name: &str) -> Result<()> {
        let create_args = vec!["checkout", "-b", branch_name];
        let cmd = format!("git checkout -b {branch_name}");
        if self.executor.execute(&create_args, &self.repo_path).is_ok() {
            self.history.push(GitOpResult::ok(format!("Created branch '{branch_name}'"), cmd));
            return Ok(());
        }
        let switch_args = vec!["checkout", branch_name];
        let cmd = format!("git checkout {branch_name}");
        self.record(
            self.executor.execute(&switch_args, &self.repo_path),
            format!("Switched to branch '{branch_name}'"),
            cmd,
        )?;
        Ok(())
    }

    pub fn stage(&mut self, file_path: &str) -> Result<()> {
        let cmd = format!("git add {file_path}");
        self.record(
            self.executor.execute(&["add", file_path], &self.repo_path),
            format!("Staged {file_path}"),
            cmd,
        )?;
        Ok(())
    }

    /// Commit staged changes with a fixed synthetic author identity (spec §4.7).
    pub fn commit(&mut self, message: &str) -> Result<String> {
        let cmd = format!("git commit -m <message>");
        let args = vec![
            "-c",
            "user.name=ci-healer-bot",
            "-c",
            "user.email=ci-healer-bot@users.noreply.github.com",
            "commit",
            "-m",
            message,
        ];
        self.record(
            self.executor.execute(&args, &self.repo_path),
            format!("Committed: {message}"),
            cmd,
        )?;
        self.executor.execute(&["rev-parse", "HEAD"], &self.repo_path)
    }

    /// Force-push `branch_name` with a GitHub token injected into the remote
    /// URL, then restore the original remote URL (spec §4.7, §6).
    pub fn push_with_credential(&mut self, branch_name: &str, token: &str) -> Result<()> {
        if self.is_local_path() {
            info!("remote is a local path; skipping credentialed push");
            return Ok(());
        }

        let original_url = self
            .executor
            .execute(&["remote", "get-url", "origin"], &self.repo_path)?;

        let credentialed_url = inject_credential(&original_url, token)?;

        self.executor
            .execute(&["remote", "set-url", "origin", &credentialed_url], &self.repo_path)
            .context("failed to rewrite remote URL with credential")?;

        let push_result = self.executor.execute(
            &["push", "--force", "origin", branch_name],
            &self.repo_path,
        );

        // Always restore, even on push failure.
        let restore = self
            .executor
            .execute(&["remote", "set-url", "origin", &original_url], &self.repo_path);
        if let Err(e) = restore {
            warn!(error = %e, "failed to restore original remote URL");
        }

        let cmd = format!("git push --force origin {branch_name}");
        self.record(push_result, format!("Pushed branch '{branch_name}'"), cmd)?;
        Ok(())
    }

    fn is_local_path(&self) -> bool {
        let url = self
            .executor
            .execute(&["remote", "get-url", "origin"], &self.repo_path)
            .unwrap_or_default();
        url.starts_with('/') || url.starts_with("file://") || !url.contains("://") && !url.contains('@')
    }
}

/// Rewrite an `https://` remote URL to embed a bearer token for
/// authentication (GitHub's `https://<token>@github.com/...` convention).
fn inject_credential(url: &str, token: &str) -> Result<String> {
    if let Some(rest) = url.strip_prefix("https://") {
        // Strip any existing userinfo before injecting, to avoid doubling up.
        let rest = rest.split('@').last().unwrap_or(rest);
        Ok(format!("https://{token}@{rest}"))
    } else {
        bail!("cannot inject credential into non-https remote URL: {url}")
    }
}
