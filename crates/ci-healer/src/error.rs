//! Crate-local error enum for the handful of kinds the orchestrator must
//! distinguish. Stages otherwise propagate `anyhow::Result` (see
//! `SPEC_FULL.md` §C) — this type exists only where the driver needs to
//! branch on *kind*, not just report a message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealerError {
    #[error("repository clone failed: {0}")]
    CloneFailed(String),

    #[error("no language could be detected for repository at {0}")]
    LanguageUndetected(String),

    #[error("LLM request failed: {0}")]
    LlmRequestFailed(String),

    #[error("LLM quota or rate limit exceeded: {0}")]
    LlmRateLimited(String),

    #[error("git operation failed: {0}")]
    GitOperationFailed(String),

    #[error("result artifact write failed: {0}")]
    ArtifactWriteFailed(String),

    #[error("fatal pipeline error: {0}")]
    Fatal(String),
}
