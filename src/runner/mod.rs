//! External test-runner seam.
//!
//! The runner is a separate program. It receives the shard's test files on its
//! command line and reports progress as newline-delimited JSON events on
//! stdout. Anything on stdout that is not an event is ordinary output.

pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunnerConfig;
use crate::healing::DomSnapshot;
use crate::job::TestRunJob;

pub use self::process::ProcessRunner;

/// Upper bound on captured stdout and stderr, per stream.
pub const MAX_CAPTURED_OUTPUT: usize = 10 * 1024 * 1024;

/// Upper bound on a single stdout line held in memory.
pub const MAX_EVENT_LINE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start runner {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runner {0} was not captured")]
    Pipe(&'static str),

    #[error("runner i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Event protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RunnerEvent {
    Begin(RunBegin),
    TestBegin(TestBegin),
    TestEnd(TestOutcome),
    Error(RunnerFailure),
    End(RunnerEnd),
    Heal(HealRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBegin {
    #[serde(default)]
    pub total_tests: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBegin {
    pub test_file: String,
    pub test_name: String,
}

/// Per-test result as the runner reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub test_file: String,
    pub test_name: String,
    #[serde(default)]
    pub title_path: Vec<String>,
    pub status: TestStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunnerFailure>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub annotations: Vec<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RunnerEnd {
    pub status: RunnerStatus,
}

/// Overall status the runner claims at the end of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Passed,
    Failed,
    Timedout,
    Interrupted,
}

/// Request to heal a selector, answered on the runner's stdin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealRequest {
    pub request_id: String,
    pub test_file: String,
    pub test_name: String,
    pub selector: String,
    pub snapshot: DomSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Parse one stdout line as an event. Non-event lines yield `None`.
pub fn parse_event(line: &str) -> Option<RunnerEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Fully resolved command line for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl RunnerInvocation {
    /// Configured program and args, then the test files in order, then the
    /// shard designator. The runner's own parallelism is pinned to one
    /// worker unless the config says otherwise.
    pub fn for_job(job: &TestRunJob, config: &RunnerConfig, worker_id: &str) -> Self {
        let mut args = config.args.clone();
        args.extend(job.test_files.iter().cloned());
        args.push(format!("--shard={}", job.shard_arg()));
        if config.single_worker {
            args.push("--workers=1".to_string());
        }

        let mut env = config.env.clone();
        env.insert("SHARDRUNNER_RUN_ID".into(), job.run_id.clone());
        env.insert("SHARDRUNNER_TENANT_ID".into(), job.tenant_id.clone());
        env.insert("SHARDRUNNER_SHARD_INDEX".into(), job.shard_index.to_string());
        env.insert("SHARDRUNNER_TOTAL_SHARDS".into(), job.total_shards.to_string());
        env.insert("SHARDRUNNER_WORKER_ID".into(), worker_id.to_string());
        for (key, value) in [
            ("SHARDRUNNER_PROJECT", &job.project),
            ("SHARDRUNNER_BRANCH", &job.branch),
            ("SHARDRUNNER_COMMIT_SHA", &job.commit_sha),
        ] {
            if let Some(value) = value {
                env.insert(key.into(), value.clone());
            }
        }

        Self {
            program: config.program.clone(),
            args,
            env,
            workdir: config.workdir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failed(i32),
    /// Killed by a signal; no exit code.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOutput {
    pub exit: ExitOutcome,
    pub stdout: String,
    pub stderr: String,
    /// Captured output hit [`MAX_CAPTURED_OUTPUT`] and the rest was dropped.
    pub truncated: bool,
}

/// Receives events as the runner emits them.
#[async_trait]
pub trait RunnerEventHandler: Send {
    /// Handle one event. A `Some` reply is written back to the runner.
    async fn on_event(&mut self, event: RunnerEvent) -> Option<HealResponse>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &RunnerInvocation,
        events: &mut dyn RunnerEventHandler,
    ) -> Result<RunnerOutput, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::sample_job;

    #[test]
    fn test_invocation_for_job() {
        let mut job = sample_job(2, 4, 3);
        job.commit_sha = Some("abc123".to_string());
        let config = RunnerConfig::default();

        let inv = RunnerInvocation::for_job(&job, &config, "worker-1");
        assert_eq!(inv.program, "npx");
        assert_eq!(
            inv.args,
            vec![
                "playwright",
                "test",
                "tests/spec-0.spec.ts",
                "tests/spec-1.spec.ts",
                "tests/spec-2.spec.ts",
                "--shard=3/4",
                "--workers=1",
            ]
        );
        assert_eq!(inv.env["SHARDRUNNER_SHARD_INDEX"], "2");
        assert_eq!(inv.env["SHARDRUNNER_WORKER_ID"], "worker-1");
        assert_eq!(inv.env["SHARDRUNNER_BRANCH"], "main");
        assert_eq!(inv.env["SHARDRUNNER_COMMIT_SHA"], "abc123");
        assert!(!inv.env.contains_key("SHARDRUNNER_PROJECT"));
    }

    #[test]
    fn test_parse_events() {
        assert_eq!(
            parse_event(r#"{"event":"begin","totalTests":5}"#),
            Some(RunnerEvent::Begin(RunBegin { total_tests: 5 }))
        );
        assert_eq!(
            parse_event(r#"{"event":"end","status":"timedout"}"#),
            Some(RunnerEvent::End(RunnerEnd {
                status: RunnerStatus::Timedout
            }))
        );

        let end = parse_event(
            r#"{"event":"testEnd","testFile":"a.spec.ts","testName":"works","status":"timedOut","durationMs":30000,"attachments":[{"name":"trace","path":"/tmp/t.zip"}]}"#,
        );
        match end {
            Some(RunnerEvent::TestEnd(outcome)) => {
                assert_eq!(outcome.status, TestStatus::TimedOut);
                assert_eq!(outcome.attachments[0].path.as_deref(), Some(std::path::Path::new("/tmp/t.zip")));
                assert!(outcome.title_path.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_heal_request_carries_snapshot() {
        let line = r##"{"event":"heal","requestId":"h1","testFile":"a.spec.ts","testName":"t","selector":"#go","snapshot":{"elements":[{"tag":"button","attributes":{"data-testid":"go"}}]}}"##;
        match parse_event(line) {
            Some(RunnerEvent::Heal(req)) => {
                assert_eq!(req.request_id, "h1");
                assert_eq!(req.snapshot.elements.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_plain_output_is_not_an_event() {
        assert_eq!(parse_event("Running 10 tests using 1 worker"), None);
        assert_eq!(parse_event("{not json"), None);
        assert_eq!(parse_event(r#"{"event":"unknown"}"#), None);
    }
}
