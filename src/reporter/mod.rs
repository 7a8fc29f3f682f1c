//! Run/shard result reporter.
//!
//! Turns runner progress into stream messages. `run:start` goes out before any
//! test message, results are batched in completion order, and `run:end` is the
//! last message of the run, preceded by the final flush. A lost stream never
//! reaches the caller: the reporter keeps its tally and stops sending.

pub mod artifact;
pub mod transport;
pub mod wire;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collector::ArtifactStore;
use crate::job::TestRunJob;
use crate::runner::{TestOutcome, TestStatus};

pub use self::transport::{
    FramedTransport, StreamOptions, TcpConnector, Transport, TransportConnector, TransportError,
};
pub use self::wire::{
    ErrorDetail, Hello, RecordStatus, RunEnd, RunError, RunStart, RunStatus, StreamMessage,
    TestBatch, TestResultRecord, TestStart,
};

/// Identity of the run a reporter speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub tenant_id: String,
    pub shard_index: u32,
    pub total_shards: u32,
    pub worker_id: String,
}

impl RunContext {
    pub fn for_job(job: &TestRunJob, worker_id: &str) -> Self {
        Self {
            run_id: job.run_id.clone(),
            tenant_id: job.tenant_id.clone(),
            shard_index: job.shard_index,
            total_shards: job.total_shards,
            worker_id: worker_id.to_string(),
        }
    }

    pub fn hello(&self) -> Hello {
        Hello {
            run_id: self.run_id.clone(),
            tenant_id: self.tenant_id.clone(),
            worker_id: self.worker_id.clone(),
        }
    }
}

/// Running tally for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl RunProgress {
    pub fn completed(&self) -> u32 {
        self.passed + self.failed + self.skipped
    }

    fn record(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Passed => self.passed += 1,
            RecordStatus::Failed => self.failed += 1,
            RecordStatus::Skipped => self.skipped += 1,
        }
    }
}

impl From<TestStatus> for RecordStatus {
    fn from(status: TestStatus) -> Self {
        match status {
            TestStatus::Passed => RecordStatus::Passed,
            TestStatus::Failed | TestStatus::TimedOut => RecordStatus::Failed,
            TestStatus::Skipped | TestStatus::Interrupted => RecordStatus::Skipped,
        }
    }
}

/// What the reporter did over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    pub progress: RunProgress,
    pub batches: u32,
    /// Messages that could not be streamed.
    pub dropped: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Ended(RunStatus),
}

pub struct Reporter {
    context: RunContext,
    batch_size: usize,
    transport: Option<Box<dyn Transport>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    phase: Phase,
    progress: RunProgress,
    pending: Vec<TestResultRecord>,
    batches: u32,
    dropped: u32,
}

impl Reporter {
    /// `transport` is `None` when streaming is unavailable; the reporter then
    /// only keeps its tally.
    pub fn new(context: RunContext, batch_size: usize, transport: Option<Box<dyn Transport>>) -> Self {
        Self {
            context,
            batch_size: batch_size.max(1),
            transport,
            artifacts: None,
            phase: Phase::NotStarted,
            progress: RunProgress::default(),
            pending: Vec::new(),
            batches: 0,
            dropped: 0,
        }
    }

    /// Upload attachments through `store` before their record is queued.
    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn progress(&self) -> RunProgress {
        self.progress
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.transport.is_some()
    }

    /// Emit `run:start`. Only the first call has any effect.
    pub fn on_begin(&mut self, total_tests: u32) {
        if self.phase != Phase::NotStarted {
            debug!(run_id = %self.context.run_id, "run already started, ignoring begin");
            return;
        }
        self.phase = Phase::Running;
        self.progress.total = total_tests;
        info!(
            run_id = %self.context.run_id,
            shard = self.context.shard_index,
            total_tests,
            "run started"
        );
        self.emit(StreamMessage::RunStart(RunStart {
            run_id: self.context.run_id.clone(),
            total_tests,
            shard_index: self.context.shard_index,
            total_shards: self.context.total_shards,
            worker_id: self.context.worker_id.clone(),
            timestamp: Utc::now(),
        }));
    }

    pub fn on_test_begin(&mut self, test_file: &str, test_name: &str) {
        if !self.accepting("test:start") {
            return;
        }
        self.emit(StreamMessage::TestStart(TestStart {
            run_id: self.context.run_id.clone(),
            test_file: test_file.to_string(),
            test_name: test_name.to_string(),
            shard_index: self.context.shard_index,
            worker_id: self.context.worker_id.clone(),
            timestamp: Utc::now(),
        }));
    }

    /// Queue the result, uploading attachments first. Flushes once the batch is full.
    pub async fn on_test_end(&mut self, outcome: &TestOutcome) {
        if !self.accepting("test result") {
            return;
        }
        let mut record = self.record_for(outcome);
        if let Some(store) = &self.artifacts {
            if !outcome.attachments.is_empty() {
                artifact::upload_attachments(
                    store.as_ref(),
                    &self.context.tenant_id,
                    &outcome.attachments,
                    &mut record,
                )
                .await;
            }
        }
        self.progress.record(record.status);
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            self.flush();
        }
    }

    /// Report an error not tied to a single test. Does not end the run.
    pub fn on_error(&mut self, message: &str, stack: Option<&str>) {
        if !self.accepting("run:error") {
            return;
        }
        warn!(run_id = %self.context.run_id, error = %message, "run error");
        self.emit(StreamMessage::RunError(RunError {
            run_id: self.context.run_id.clone(),
            error: ErrorDetail {
                message: message.to_string(),
                stack: stack.map(str::to_string),
            },
            timestamp: Utc::now(),
        }));
    }

    /// Flush the remaining batch, emit `run:end`, and close the stream.
    ///
    /// Later calls return the same summary without sending anything.
    pub async fn on_end(&mut self, status: RunStatus) -> RunSummary {
        if let Phase::Ended(status) = self.phase {
            return self.summary(status);
        }
        self.ensure_started();
        self.flush();

        let total_tests = self.progress.total.max(self.progress.completed());
        self.emit(StreamMessage::RunEnd(RunEnd {
            run_id: self.context.run_id.clone(),
            status,
            total_tests,
            passed_tests: self.progress.passed,
            failed_tests: self.progress.failed,
            skipped_tests: self.progress.skipped,
            timestamp: Utc::now(),
        }));
        self.phase = Phase::Ended(status);

        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
        }
        let summary = self.summary(status);
        info!(
            run_id = %self.context.run_id,
            shard = self.context.shard_index,
            passed = summary.progress.passed,
            failed = summary.progress.failed,
            skipped = summary.progress.skipped,
            dropped = summary.dropped,
            "run ended"
        );
        summary
    }

    fn summary(&self, status: RunStatus) -> RunSummary {
        RunSummary {
            status,
            progress: self.progress,
            batches: self.batches,
            dropped: self.dropped,
        }
    }

    /// False once the run has ended. Starts the run implicitly otherwise.
    fn accepting(&mut self, what: &str) -> bool {
        if let Phase::Ended(_) = self.phase {
            warn!(run_id = %self.context.run_id, message = what, "run already ended, dropping");
            return false;
        }
        self.ensure_started();
        true
    }

    /// A runner that never reported `begin` still gets a `run:start` first.
    fn ensure_started(&mut self) {
        if self.phase == Phase::NotStarted {
            self.on_begin(0);
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let results = std::mem::take(&mut self.pending);
        debug!(run_id = %self.context.run_id, size = results.len(), "flushing result batch");
        self.batches += 1;
        self.emit(StreamMessage::TestBatch(TestBatch {
            run_id: self.context.run_id.clone(),
            results,
        }));
    }

    fn emit(&mut self, message: StreamMessage) {
        let Some(transport) = self.transport.as_mut() else {
            self.dropped += 1;
            return;
        };
        let kind = message.kind();
        if let Err(e) = transport.send(message) {
            warn!(
                run_id = %self.context.run_id,
                message = kind,
                error = %e,
                "result stream lost, continuing without streaming"
            );
            self.transport = None;
            self.dropped += 1;
        }
    }

    fn record_for(&self, outcome: &TestOutcome) -> TestResultRecord {
        let test_title = if outcome.title_path.is_empty() {
            outcome.test_name.clone()
        } else {
            outcome.title_path.join(" › ")
        };
        TestResultRecord {
            run_id: self.context.run_id.clone(),
            test_file: outcome.test_file.clone(),
            test_name: outcome.test_name.clone(),
            test_title,
            shard_index: self.context.shard_index,
            worker_id: self.context.worker_id.clone(),
            status: outcome.status.into(),
            duration_ms: outcome.duration_ms,
            retry_count: outcome.retry,
            error_message: outcome.error.as_ref().map(|e| e.message.clone()),
            error_stack: outcome.error.as_ref().and_then(|e| e.stack.clone()),
            trace_url: None,
            screenshot_url: None,
            video_url: None,
            metadata: serde_json::json!({
                "annotations": outcome.annotations,
                "tags": outcome.tags,
            }),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::artifact::testing::MemoryStore;
    use super::transport::testing::MemoryTransport;
    use super::*;
    use crate::runner::{Attachment, RunnerFailure};

    fn context() -> RunContext {
        RunContext {
            run_id: "run-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            shard_index: 1,
            total_shards: 3,
            worker_id: "worker-1".to_string(),
        }
    }

    fn outcome(i: usize, status: TestStatus) -> TestOutcome {
        TestOutcome {
            test_file: "suite.spec.ts".to_string(),
            test_name: format!("test {i}"),
            title_path: vec!["suite".to_string(), format!("test {i}")],
            status,
            duration_ms: 5,
            retry: 0,
            error: None,
            attachments: vec![],
            annotations: vec![],
            tags: vec!["@smoke".to_string()],
        }
    }

    fn reporter(transport: &MemoryTransport, batch_size: usize) -> Reporter {
        Reporter::new(context(), batch_size, Some(Box::new(transport.clone())))
    }

    fn batch_sizes(messages: &[StreamMessage]) -> Vec<usize> {
        messages
            .iter()
            .filter_map(|m| match m {
                StreamMessage::TestBatch(b) => Some(b.results.len()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_twenty_three_passing_tests_batch_by_ten() {
        let transport = MemoryTransport::default();
        let mut reporter = reporter(&transport, 10);
        reporter.on_begin(23);
        for i in 0..23 {
            reporter.on_test_begin("suite.spec.ts", &format!("test {i}"));
            reporter.on_test_end(&outcome(i, TestStatus::Passed)).await;
            if i == 19 {
                assert_eq!(batch_sizes(&transport.messages()), vec![10, 10]);
                assert_eq!(reporter.pending(), 0);
            }
        }
        assert_eq!(reporter.pending(), 3);
        let summary = reporter.on_end(RunStatus::Completed).await;

        let messages = transport.messages();
        assert_eq!(batch_sizes(&messages), vec![10, 10, 3]);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.dropped, 0);

        let kinds = transport.kinds();
        assert_eq!(kinds.first(), Some(&"run:start"));
        assert_eq!(kinds.last(), Some(&"run:end"));
        assert_eq!(kinds[kinds.len() - 2], "test:batch");
        match messages.last() {
            Some(StreamMessage::RunEnd(end)) => {
                assert_eq!(end.passed_tests, 23);
                assert_eq!(end.failed_tests, 0);
                assert_eq!(end.skipped_tests, 0);
                assert_eq!(end.total_tests, 23);
                assert_eq!(end.status, RunStatus::Completed);
            }
            other => panic!("expected run:end, got {other:?}"),
        }
        assert!(*transport.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_batches_preserve_completion_order() {
        let transport = MemoryTransport::default();
        let mut reporter = reporter(&transport, 2);
        for i in 0..3 {
            reporter.on_test_end(&outcome(i, TestStatus::Passed)).await;
        }
        reporter.on_end(RunStatus::Completed).await;

        let names: Vec<String> = transport
            .messages()
            .into_iter()
            .filter_map(|m| match m {
                StreamMessage::TestBatch(b) => Some(b.results),
                _ => None,
            })
            .flatten()
            .map(|r| r.test_name)
            .collect();
        assert_eq!(names, vec!["test 0", "test 1", "test 2"]);
    }

    #[tokio::test]
    async fn test_run_start_is_implicit_and_precedes_tests() {
        let transport = MemoryTransport::default();
        let mut reporter = reporter(&transport, 10);
        reporter.on_test_begin("a.spec.ts", "first");
        reporter.on_begin(5);
        reporter.on_end(RunStatus::Completed).await;

        assert_eq!(transport.kinds(), vec!["run:start", "test:start", "run:end"]);
        match &transport.messages()[0] {
            StreamMessage::RunStart(start) => {
                assert_eq!(start.total_tests, 0);
                assert_eq!(start.shard_index, 1);
                assert_eq!(start.total_shards, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_mapping_and_tally() {
        let transport = MemoryTransport::default();
        let mut reporter = reporter(&transport, 10);
        reporter.on_begin(2);
        let mut failing = outcome(0, TestStatus::TimedOut);
        failing.error = Some(RunnerFailure {
            message: "Timeout 30000ms exceeded".to_string(),
            stack: Some("at login.spec.ts:12".to_string()),
        });
        reporter.on_test_end(&failing).await;
        reporter.on_test_end(&outcome(1, TestStatus::Interrupted)).await;
        reporter.on_test_end(&outcome(2, TestStatus::Failed)).await;
        let summary = reporter.on_end(RunStatus::Failed).await;

        assert_eq!(
            summary.progress,
            RunProgress {
                total: 2,
                passed: 0,
                failed: 2,
                skipped: 1
            }
        );
        let records = match &transport.messages()[1] {
            StreamMessage::TestBatch(b) => b.results.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(records[0].status, RecordStatus::Failed);
        assert_eq!(records[0].error_message.as_deref(), Some("Timeout 30000ms exceeded"));
        assert_eq!(records[0].test_title, "suite › test 0");
        assert_eq!(records[0].metadata["tags"][0], "@smoke");
        assert_eq!(records[1].status, RecordStatus::Skipped);

        match transport.messages().last() {
            Some(StreamMessage::RunEnd(end)) => assert_eq!(end.total_tests, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_error_does_not_end_run() {
        let transport = MemoryTransport::default();
        let mut reporter = reporter(&transport, 10);
        reporter.on_begin(1);
        reporter.on_error("worker process crashed", None);
        reporter.on_test_end(&outcome(0, TestStatus::Passed)).await;
        reporter.on_end(RunStatus::Failed).await;

        assert_eq!(
            transport.kinds(),
            vec!["run:start", "run:error", "test:batch", "run:end"]
        );
    }

    #[tokio::test]
    async fn test_end_is_emitted_once() {
        let transport = MemoryTransport::default();
        let mut reporter = reporter(&transport, 10);
        reporter.on_begin(1);
        let first = reporter.on_end(RunStatus::Completed).await;
        let second = reporter.on_end(RunStatus::Failed).await;
        reporter.on_test_end(&outcome(0, TestStatus::Passed)).await;

        assert_eq!(first, second);
        assert_eq!(transport.kinds(), vec!["run:start", "run:end"]);
    }

    #[tokio::test]
    async fn test_lost_stream_degrades_to_local_tally() {
        // run:start and one test:start get through, then the stream dies.
        let transport = MemoryTransport::failing_after(2);
        let mut reporter = reporter(&transport, 1);
        reporter.on_begin(3);
        for i in 0..3 {
            reporter.on_test_begin("suite.spec.ts", &format!("test {i}"));
            reporter.on_test_end(&outcome(i, TestStatus::Passed)).await;
        }
        assert!(!reporter.is_streaming());
        let summary = reporter.on_end(RunStatus::Completed).await;

        assert_eq!(summary.progress.passed, 3);
        assert_eq!(transport.kinds(), vec!["run:start", "test:start"]);
        // test:batch, test:start, test:batch, test:start, test:batch, run:end
        assert_eq!(summary.dropped, 6);
    }

    #[tokio::test]
    async fn test_without_transport_counts_only() {
        let mut reporter = Reporter::new(context(), 10, None);
        reporter.on_begin(1);
        reporter.on_test_end(&outcome(0, TestStatus::Skipped)).await;
        let summary = reporter.on_end(RunStatus::Completed).await;
        assert_eq!(summary.progress.skipped, 1);
        assert_eq!(summary.dropped, 3);
    }

    #[tokio::test]
    async fn test_attachments_uploaded_before_record_is_queued() {
        let transport = MemoryTransport::default();
        let store = Arc::new(MemoryStore::default());
        let mut reporter = reporter(&transport, 10).with_artifacts(store.clone());
        let mut failed = outcome(0, TestStatus::Failed);
        failed.attachments = vec![
            Attachment {
                name: "screenshot".to_string(),
                path: Some("/tmp/shot.png".into()),
                content_type: Some("image/png".to_string()),
            },
            Attachment {
                name: "trace".to_string(),
                path: Some("/tmp/trace.zip".into()),
                content_type: None,
            },
        ];
        reporter.on_test_end(&failed).await;
        reporter.on_end(RunStatus::Failed).await;

        let record = match &transport.messages()[1] {
            StreamMessage::TestBatch(b) => b.results[0].clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(record.screenshot_url.as_deref(), Some("memory://screenshot/screenshot"));
        assert_eq!(record.trace_url.as_deref(), Some("memory://trace/trace"));
        assert_eq!(store.uploads.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_ends_when_collector_stops_reading() {
        use std::time::Duration;

        use super::transport::{FramedTransport, StreamOptions};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let options = StreamOptions {
            close_timeout: Duration::from_millis(200),
            ..StreamOptions::default()
        };
        let transport = FramedTransport::connect(&addr, context().hello(), options)
            .await
            .unwrap();
        let mut reporter = Reporter::new(context(), 1, Some(Box::new(transport)));

        for i in 0..300 {
            let mut failed = outcome(i, TestStatus::Failed);
            failed.error = Some(RunnerFailure {
                message: "assertion failed".to_string(),
                stack: Some("at frame\n".repeat(6 * 1024)),
            });
            reporter.on_test_end(&failed).await;
        }

        let summary = tokio::time::timeout(Duration::from_secs(10), reporter.on_end(RunStatus::Failed))
            .await
            .expect("on_end hung on a stalled stream");
        assert_eq!(summary.progress.failed, 300);
        assert_eq!(summary.status, RunStatus::Failed);
        peer.abort();
    }
}
