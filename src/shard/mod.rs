//! Shard lifecycle: `running` then exactly one terminal state.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Running,
    Completed,
    Failed,
}

impl ShardState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ShardState::Running)
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardState::Running => write!(f, "running"),
            ShardState::Completed => write!(f, "completed"),
            ShardState::Failed => write!(f, "failed"),
        }
    }
}

/// Status snapshot for one `(run_id, shard_index)` as reported to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatus {
    pub run_id: String,
    pub shard_index: u32,
    pub status: ShardState,
    pub worker_id: String,
    pub actual_duration_ms: Option<u64>,
}

/// Enforces the shard transition rules for one processing attempt.
///
/// `running` is entered once at claim time; the first terminal transition wins
/// and every later one is refused.
#[derive(Debug)]
pub struct ShardTracker {
    run_id: String,
    shard_index: u32,
    worker_id: String,
    state: ShardState,
    started: Instant,
}

impl ShardTracker {
    /// Claim the shard. Returns the tracker and the `running` status to report.
    pub fn claim(run_id: &str, shard_index: u32, worker_id: &str) -> (Self, ShardStatus) {
        let tracker = Self {
            run_id: run_id.to_string(),
            shard_index,
            worker_id: worker_id.to_string(),
            state: ShardState::Running,
            started: Instant::now(),
        };
        let status = tracker.snapshot(None);
        (tracker, status)
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn complete(&mut self) -> Option<ShardStatus> {
        self.finish(ShardState::Completed)
    }

    pub fn fail(&mut self) -> Option<ShardStatus> {
        self.finish(ShardState::Failed)
    }

    fn finish(&mut self, terminal: ShardState) -> Option<ShardStatus> {
        if self.state.is_terminal() {
            warn!(
                run_id = %self.run_id,
                shard = self.shard_index,
                current = %self.state,
                requested = %terminal,
                "ignoring transition out of terminal shard state"
            );
            return None;
        }
        self.state = terminal;
        // Wall-clock rounding must never report a zero duration for a finished shard.
        let elapsed_ms = (self.started.elapsed().as_millis() as u64).max(1);
        Some(self.snapshot(Some(elapsed_ms)))
    }

    fn snapshot(&self, actual_duration_ms: Option<u64>) -> ShardStatus {
        ShardStatus {
            run_id: self.run_id.clone(),
            shard_index: self.shard_index,
            status: self.state,
            worker_id: self.worker_id.clone(),
            actual_duration_ms,
        }
    }
}
