//! Result stream messages and their line codec.
//!
//! Each message is one JSON object per line: `{"type": "...", "payload": {...}}`.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest accepted line. A full batch of records with error stacks fits well
/// inside this.
const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum StreamMessage {
    #[serde(rename = "hello")]
    Hello(Hello),
    #[serde(rename = "run:start")]
    RunStart(RunStart),
    #[serde(rename = "test:start")]
    TestStart(TestStart),
    #[serde(rename = "test:batch")]
    TestBatch(TestBatch),
    #[serde(rename = "run:end")]
    RunEnd(RunEnd),
    #[serde(rename = "run:error")]
    RunError(RunError),
}

impl StreamMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Hello(_) => "hello",
            StreamMessage::RunStart(_) => "run:start",
            StreamMessage::TestStart(_) => "test:start",
            StreamMessage::TestBatch(_) => "test:batch",
            StreamMessage::RunEnd(_) => "run:end",
            StreamMessage::RunError(_) => "run:error",
        }
    }
}

/// Connection handshake, sent before any run event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub run_id: String,
    pub tenant_id: String,
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStart {
    pub run_id: String,
    pub total_tests: u32,
    pub shard_index: u32,
    pub total_shards: u32,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStart {
    pub run_id: String,
    pub test_file: String,
    pub test_name: String,
    pub shard_index: u32,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBatch {
    pub run_id: String,
    pub results: Vec<TestResultRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEnd {
    pub run_id: String,
    pub status: RunStatus,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub skipped_tests: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub run_id: String,
    pub error: ErrorDetail,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Passed,
    Failed,
    Skipped,
}

/// One executed test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultRecord {
    pub run_id: String,
    pub test_file: String,
    pub test_name: String,
    pub test_title: String,
    pub shard_index: u32,
    pub worker_id: String,
    pub status: RecordStatus,
    pub duration_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("stream i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream framing failed: {0}")]
    Lines(#[from] LinesCodecError),

    #[error("invalid stream message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Newline-delimited JSON framing for [`StreamMessage`].
pub struct StreamCodec {
    inner: LinesCodec,
}

impl StreamCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<StreamMessage> for StreamCodec {
    type Error = CodecError;

    fn encode(&mut self, item: StreamMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        self.inner.encode(line, dst)?;
        Ok(())
    }
}

impl Decoder for StreamCodec {
    type Item = StreamMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(&line)?)),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src)? {
            Some(line) if !line.trim().is_empty() => Ok(Some(serde_json::from_str(&line)?)),
            _ => Ok(None),
        }
    }
}
