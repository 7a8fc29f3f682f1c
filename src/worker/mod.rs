//! Execution worker: claims a shard job, runs it, and reports the outcome.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::{ArtifactStore, DispatchHandle, HealingEvent};
use crate::config::{HealingConfig, RunnerConfig, WorkerConfig};
use crate::healing::{HealingAttempt, HealingStats, SelectorHealer};
use crate::job::{JobError, JobSource, TestRunJob};
use crate::reporter::{Reporter, RunContext, RunStatus, RunSummary, Transport, TransportConnector};
use crate::runner::{
    ExitOutcome, HealRequest, HealResponse, RunnerError, RunnerEvent, RunnerEventHandler,
    RunnerInvocation, RunnerOutput, RunnerStatus, TestRunner,
};
use crate::shard::{ShardState, ShardStatus, ShardTracker};

/// Longest stderr excerpt carried in an error.
const STDERR_EXCERPT: usize = 4096;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid job: {0}")]
    InvalidJob(#[from] JobError),

    #[error("test runner exited with code {code} without producing output: {stderr}")]
    Toolchain { code: i32, stderr: String },

    #[error("test runner was terminated by a signal: {stderr}")]
    Terminated { stderr: String },

    #[error("shutdown requested while the test runner was running")]
    Interrupted,

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// How a finished runner is judged at the shard level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Passed,
    /// Non-zero exit with output: some tests failed, the pipeline did not.
    TestsFailed { code: i32 },
}

/// Classify a runner exit.
///
/// A non-zero exit with stdout means tests failed. Without stdout it is a
/// toolchain failure, and a signal is always a failure.
pub fn classify(output: &RunnerOutput) -> Result<RunVerdict, WorkerError> {
    match output.exit {
        ExitOutcome::Success => Ok(RunVerdict::Passed),
        ExitOutcome::Failed(code) if !output.stdout.trim().is_empty() => {
            Ok(RunVerdict::TestsFailed { code })
        }
        ExitOutcome::Failed(code) => Err(WorkerError::Toolchain {
            code,
            stderr: excerpt(&output.stderr),
        }),
        ExitOutcome::Terminated => Err(WorkerError::Terminated {
            stderr: excerpt(&output.stderr),
        }),
    }
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    match trimmed.char_indices().nth(STDERR_EXCERPT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Result of a successfully processed shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardReport {
    pub run_id: String,
    pub shard_index: u32,
    pub status: ShardState,
    pub actual_duration_ms: Option<u64>,
    pub verdict: RunVerdict,
    pub summary: RunSummary,
    pub healing: HealingStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeStats {
    pub completed: u64,
    pub failed: u64,
}

pub struct ExecutionWorker {
    worker_id: String,
    batch_size: usize,
    runner_config: RunnerConfig,
    healing_config: HealingConfig,
    runner: Arc<dyn TestRunner>,
    dispatch: DispatchHandle,
    connector: Option<Arc<dyn TransportConnector>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    shutdown: CancellationToken,
}

impl ExecutionWorker {
    pub fn new(config: &WorkerConfig, runner: Arc<dyn TestRunner>, dispatch: DispatchHandle) -> Self {
        Self {
            worker_id: config.worker_id(),
            batch_size: config.worker.batch_size,
            runner_config: config.runner.clone(),
            healing_config: config.healing.clone(),
            runner,
            dispatch,
            connector: None,
            artifacts: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `token` stops the running job, which then fails its shard,
    /// and stops `consume` from taking further jobs.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Stream results through `connector`, one connection per job.
    pub fn with_stream(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one shard to completion.
    ///
    /// Test failures are a successful job. A toolchain failure or a killed
    /// runner marks the shard failed and is returned so the job source can
    /// decide on redelivery. Collector calls never affect the result.
    pub async fn process_job(&self, job: &TestRunJob) -> Result<ShardReport, WorkerError> {
        job.validate()?;
        info!(
            run_id = %job.run_id,
            shard = job.shard_index,
            total_shards = job.total_shards,
            files = job.test_files.len(),
            worker_id = %self.worker_id,
            "processing shard"
        );

        let (mut tracker, running) = ShardTracker::claim(&job.run_id, job.shard_index, &self.worker_id);
        self.dispatch.shard_status(running);

        let context = RunContext::for_job(job, &self.worker_id);
        let transport = self.open_stream(&context).await;
        let mut reporter = Reporter::new(context, self.batch_size, transport);
        if let Some(store) = &self.artifacts {
            reporter = reporter.with_artifacts(store.clone());
        }
        let healer = SelectorHealer::new(&self.healing_config);

        let invocation = RunnerInvocation::for_job(job, &self.runner_config, &self.worker_id);
        let mut events = JobEvents {
            job,
            reporter: &mut reporter,
            healer: &healer,
            dispatch: &self.dispatch,
            end_status: None,
        };
        // Dropping the run future kills the runner process.
        let result = tokio::select! {
            result = self.runner.run(&invocation, &mut events) => result.map_err(WorkerError::from),
            _ = self.shutdown.cancelled() => Err(WorkerError::Interrupted),
        };
        let end_status = events.end_status;

        let verdict = result.and_then(|output| {
            if output.truncated {
                warn!(run_id = %job.run_id, shard = job.shard_index, "runner output was truncated");
            }
            classify(&output)
        });

        match verdict {
            Ok(verdict) => {
                let status = end_status.unwrap_or(match verdict {
                    RunVerdict::Passed => RunStatus::Completed,
                    RunVerdict::TestsFailed { .. } => RunStatus::Failed,
                });
                let summary = reporter.on_end(status).await;
                let shard = self.finish(&mut tracker, ShardState::Completed);
                info!(
                    run_id = %job.run_id,
                    shard = job.shard_index,
                    ?verdict,
                    duration_ms = shard.as_ref().and_then(|s| s.actual_duration_ms),
                    "shard completed"
                );
                Ok(ShardReport {
                    run_id: job.run_id.clone(),
                    shard_index: job.shard_index,
                    status: tracker.state(),
                    actual_duration_ms: shard.and_then(|s| s.actual_duration_ms),
                    verdict,
                    summary,
                    healing: healer.stats(),
                })
            }
            Err(e) => {
                error!(run_id = %job.run_id, shard = job.shard_index, error = %e, "shard failed");
                reporter.on_error(&e.to_string(), None);
                reporter.on_end(RunStatus::Failed).await;
                self.finish(&mut tracker, ShardState::Failed);
                Err(e)
            }
        }
    }

    /// Process jobs one at a time until the source is exhausted.
    pub async fn consume(&self, source: &mut dyn JobSource) -> Result<ConsumeStats> {
        let mut stats = ConsumeStats::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                next = source.next_job() => next?,
            };
            let Some(job) = next else {
                break;
            };
            let started = Instant::now();
            match self.process_job(&job).await {
                Ok(report) => {
                    stats.completed += 1;
                    info!(
                        run_id = %job.run_id,
                        shard = job.shard_index,
                        passed = report.summary.progress.passed,
                        failed = report.summary.progress.failed,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "job acknowledged"
                    );
                    source.ack(&job).await?;
                }
                Err(e) => {
                    stats.failed += 1;
                    source.fail(&job, &e.to_string()).await?;
                }
            }
        }
        if self.shutdown.is_cancelled() {
            info!(completed = stats.completed, failed = stats.failed, "shutdown requested, no further jobs taken");
            return Ok(stats);
        }
        info!(completed = stats.completed, failed = stats.failed, "job source exhausted");
        Ok(stats)
    }

    async fn open_stream(&self, context: &RunContext) -> Option<Box<dyn Transport>> {
        let connector = self.connector.as_ref()?;
        match connector.connect(context.hello()).await {
            Ok(transport) => Some(transport),
            Err(e) => {
                warn!(run_id = %context.run_id, error = %e, "result stream unavailable, results will not be streamed");
                None
            }
        }
    }

    fn finish(&self, tracker: &mut ShardTracker, state: ShardState) -> Option<ShardStatus> {
        let status = match state {
            ShardState::Failed => tracker.fail(),
            _ => tracker.complete(),
        }?;
        self.dispatch.shard_status(status.clone());
        Some(status)
    }
}

/// Feeds runner events into the reporter and answers heal requests.
struct JobEvents<'a> {
    job: &'a TestRunJob,
    reporter: &'a mut Reporter,
    healer: &'a SelectorHealer,
    dispatch: &'a DispatchHandle,
    end_status: Option<RunStatus>,
}

/// Run the chain against the runner's snapshot and persist the attempt.
async fn answer_heal(
    healer: &SelectorHealer,
    dispatch: &DispatchHandle,
    job: &TestRunJob,
    request: HealRequest,
) -> HealResponse {
    let mut response = HealResponse {
        request_id: request.request_id.clone(),
        selector: None,
        strategy: None,
        confidence: None,
    };
    if !healer.is_enabled() {
        return response;
    }

    let started = Instant::now();
    let healed = healer.heal(&request.snapshot, &request.selector).await;
    let attempt = match &healed {
        Some(h) => HealingAttempt::healed(
            &request.test_file,
            &request.test_name,
            &request.selector,
            h,
            started.elapsed(),
        ),
        None => HealingAttempt::unresolved(
            &request.test_file,
            &request.test_name,
            &request.selector,
            "no healing strategy produced a matching selector",
            started.elapsed(),
        ),
    };
    dispatch.healing_event(HealingEvent {
        run_id: job.run_id.clone(),
        tenant_id: job.tenant_id.clone(),
        attempt,
    });

    if let Some(h) = healed {
        response.selector = Some(h.selector);
        response.strategy = Some(h.strategy);
        response.confidence = Some(h.confidence);
    }
    response
}

#[async_trait]
impl<'a> RunnerEventHandler for JobEvents<'a> {
    async fn on_event(&mut self, event: RunnerEvent) -> Option<HealResponse> {
        match event {
            RunnerEvent::Begin(begin) => self.reporter.on_begin(begin.total_tests),
            RunnerEvent::TestBegin(test) => self.reporter.on_test_begin(&test.test_file, &test.test_name),
            RunnerEvent::TestEnd(outcome) => self.reporter.on_test_end(&outcome).await,
            RunnerEvent::Error(failure) => {
                self.reporter.on_error(&failure.message, failure.stack.as_deref())
            }
            RunnerEvent::End(end) => {
                self.end_status = Some(match end.status {
                    RunnerStatus::Passed => RunStatus::Completed,
                    _ => RunStatus::Failed,
                });
            }
            RunnerEvent::Heal(request) => {
                return Some(answer_heal(self.healer, self.dispatch, self.job, request).await)
            }
        }
        None
    }
}
