//! Test run jobs handed to a worker by the job source.

pub mod source;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::source::{ChannelJobSource, JobReceipt, JobSource, JsonLinesJobSource};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("shard index {shard_index} out of range for {total_shards} shard(s)")]
    ShardOutOfRange { shard_index: u32, total_shards: u32 },

    #[error("job for run {run_id} has no test files")]
    NoTestFiles { run_id: String },

    #[error("job has an empty run id")]
    EmptyRunId,

    #[error("malformed job: {0}")]
    Malformed(String),
}

/// One shard of a test run. Immutable once created by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunJob {
    pub run_id: String,
    pub tenant_id: String,
    /// 0-based.
    pub shard_index: u32,
    pub total_shards: u32,
    pub test_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

impl TestRunJob {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.run_id.trim().is_empty() {
            return Err(JobError::EmptyRunId);
        }
        if self.shard_index >= self.total_shards {
            return Err(JobError::ShardOutOfRange {
                shard_index: self.shard_index,
                total_shards: self.total_shards,
            });
        }
        if self.test_files.is_empty() {
            return Err(JobError::NoTestFiles {
                run_id: self.run_id.clone(),
            });
        }
        Ok(())
    }

    /// Parse and validate a job from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, JobError> {
        let job: Self =
            serde_json::from_str(raw).map_err(|e| JobError::Malformed(e.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    /// The runner's 1-based `current/total` shard designator.
    pub fn shard_arg(&self) -> String {
        format!("{}/{}", self.shard_index + 1, self.total_shards)
    }
}

#[cfg(test)]
pub(crate) fn sample_job(shard_index: u32, total_shards: u32, files: usize) -> TestRunJob {
    TestRunJob {
        run_id: "run-42".to_string(),
        tenant_id: "tenant-a".to_string(),
        shard_index,
        total_shards,
        test_files: (0..files).map(|i| format!("tests/spec-{i}.spec.ts")).collect(),
        project: None,
        branch: Some("main".to_string()),
        commit_sha: None,
    }
}
