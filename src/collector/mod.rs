//! Results Collector wire contract.
//!
//! Nothing in here participates in whether a job succeeds: every call is
//! best-effort and callers log failures instead of propagating them.

pub mod dispatch;
pub mod http;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::healing::HealingAttempt;
use crate::shard::{ShardState, ShardStatus};

pub use self::dispatch::{DispatchHandle, DispatchStats, Dispatcher};
pub use self::http::HttpCollector;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid collector url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{endpoint} responded with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("upload response from {endpoint} carried no url")]
    MissingUrl { endpoint: String },

    #[error("failed to read artifact {path}: {source}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `PATCH /shards/{runId}/{shardIndex}` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStatusBody {
    pub status: ShardState,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_duration: Option<u64>,
}

impl From<&ShardStatus> for ShardStatusBody {
    fn from(s: &ShardStatus) -> Self {
        Self {
            status: s.status,
            worker_id: s.worker_id.clone(),
            actual_duration: s.actual_duration_ms,
        }
    }
}

/// `POST /healing/events` body: the attempt plus the run it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingEvent {
    pub run_id: String,
    /// Sent as `X-Tenant-ID`, not in the body.
    #[serde(skip)]
    pub tenant_id: String,
    #[serde(flatten)]
    pub attempt: HealingAttempt,
}

/// Artifact category, derived from the attachment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Trace,
    Screenshot,
    Video,
    Unknown,
}

impl ArtifactKind {
    /// Substring classification, checked in trace, screenshot, video order.
    pub fn classify(name: &str) -> Self {
        if name.contains("trace") {
            ArtifactKind::Trace
        } else if name.contains("screenshot") {
            ArtifactKind::Screenshot
        } else if name.contains("video") {
            ArtifactKind::Video
        } else {
            ArtifactKind::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Trace => "trace",
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::Video => "video",
            ArtifactKind::Unknown => "unknown",
        }
    }
}

/// One attachment file to push to the artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub run_id: String,
    pub tenant_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub path: PathBuf,
}

/// Status and healing-event sink.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn update_shard_status(&self, status: &ShardStatus) -> Result<(), CollectorError>;

    async fn record_healing_event(&self, event: &HealingEvent) -> Result<(), CollectorError>;
}

/// Attachment upload; returns the public URL of the stored artifact.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, upload: &ArtifactUpload) -> Result<String, CollectorError>;
}
