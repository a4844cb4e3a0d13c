//! Progress sink — a caller-supplied callback invoked after every stage
//! transition with an immutable `RunState` snapshot (spec §2, §6).
//!
//! Modeled as a trait object rather than a bare closure so the orchestrator
//! can hold it behind an `Arc` and call it from the bounded worker pool in
//! the Root-Cause Resolver (spec §4.4) as well as the driver thread, mirroring
//! the teacher's `GitExecutor`/`LlmProvider` trait-boundary pattern
//! (`autonomous::branch_manager::GitExecutor`).

use crate::types::RunState;

/// Receives an immutable snapshot of `RunState` after every stage transition.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, state: &RunState);
}

/// A sink that does nothing — the default when the caller doesn't care to
/// observe partial results.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_progress(&self, _state: &RunState) {}
}

/// A sink that records every snapshot it receives (for tests).
#[derive(Default)]
pub struct RecordingProgressSink {
    snapshots: std::sync::Mutex<Vec<RunState>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<RunState> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_progress(&self, state: &RunState) {
        self.snapshots.lock().unwrap().push(state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_accumulates_snapshots() {
        let sink = RecordingProgressSink::new();
        let state = RunState::new("https://example.com/r.git", "heal/x", "run-1");
        sink.on_progress(&state);
        sink.on_progress(&state);
        assert_eq!(sink.count(), 2);
    }
}
