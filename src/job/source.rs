//! Job source seam.
//!
//! Delivery is at-least-once: a job that is never acknowledged may be handed
//! out again. Retry and redelivery policy belong to the source, not the worker.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::warn;

use super::TestRunJob;

#[async_trait]
pub trait JobSource: Send {
    /// Next job, or `None` once the source is exhausted or closed.
    async fn next_job(&mut self) -> Result<Option<TestRunJob>>;

    /// The job finished (including runs where tests failed).
    async fn ack(&mut self, job: &TestRunJob) -> Result<()>;

    /// The job hit a worker-level failure; the source decides whether to redeliver.
    async fn fail(&mut self, job: &TestRunJob, error: &str) -> Result<()>;
}

/// Newline-delimited JSON jobs from a file or stdin.
///
/// Malformed lines are logged and skipped. Ack/fail are recorded only in the log
/// since a flat file has no redelivery.
pub struct JsonLinesJobSource<R> {
    lines: Lines<BufReader<R>>,
    line_no: usize,
}

impl<R: AsyncRead + Unpin + Send> JsonLinesJobSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }
}

impl JsonLinesJobSource<tokio::fs::File> {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open job file: {}", path.display()))?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> JobSource for JsonLinesJobSource<R> {
    async fn next_job(&mut self) -> Result<Option<TestRunJob>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match TestRunJob::from_json(line) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => warn!(line = self.line_no, error = %e, "skipping invalid job"),
            }
        }
        Ok(None)
    }

    async fn ack(&mut self, job: &TestRunJob) -> Result<()> {
        tracing::debug!(run_id = %job.run_id, shard = job.shard_index, "job acknowledged");
        Ok(())
    }

    async fn fail(&mut self, job: &TestRunJob, error: &str) -> Result<()> {
        warn!(run_id = %job.run_id, shard = job.shard_index, %error, "job failed, no redelivery for file source");
        Ok(())
    }
}

/// Outcome reported back by a worker for a job taken from a channel source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReceipt {
    Acked { run_id: String, shard_index: u32 },
    Failed { run_id: String, shard_index: u32, error: String },
}

/// In-process source fed over an mpsc channel, for embedding the worker
/// behind a queue client that lives elsewhere in the process.
pub struct ChannelJobSource {
    jobs: mpsc::Receiver<TestRunJob>,
    receipts: mpsc::UnboundedSender<JobReceipt>,
}

impl ChannelJobSource {
    pub fn new(
        jobs: mpsc::Receiver<TestRunJob>,
        receipts: mpsc::UnboundedSender<JobReceipt>,
    ) -> Self {
        Self { jobs, receipts }
    }
}

#[async_trait]
impl JobSource for ChannelJobSource {
    async fn next_job(&mut self) -> Result<Option<TestRunJob>> {
        Ok(self.jobs.recv().await)
    }

    async fn ack(&mut self, job: &TestRunJob) -> Result<()> {
        // A dropped receiver just means nobody is listening for receipts.
        let _ = self.receipts.send(JobReceipt::Acked {
            run_id: job.run_id.clone(),
            shard_index: job.shard_index,
        });
        Ok(())
    }

    async fn fail(&mut self, job: &TestRunJob, error: &str) -> Result<()> {
        let _ = self.receipts.send(JobReceipt::Failed {
            run_id: job.run_id.clone(),
            shard_index: job.shard_index,
            error: error.to_string(),
        });
        Ok(())
    }
}
