use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use super::{ArtifactStore, ArtifactUpload, Collector, CollectorError, HealingEvent, ShardStatusBody};
use crate::config::CollectorConfig;
use crate::shard::ShardStatus;

/// reqwest-backed client for the collector HTTP API and the artifact store.
#[derive(Clone)]
pub struct HttpCollector {
    client: Client,
    base_url: Url,
    artifact_url: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
}

impl HttpCollector {
    pub fn new(config: &CollectorConfig) -> Result<Self, CollectorError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(CollectorError::Client)?;
        Ok(Self {
            client,
            base_url: parse_base(&config.base_url)?,
            artifact_url: parse_base(config.artifact_base())?,
            api_key: config.api_key.clone(),
        })
    }

    /// `{base}/shards/{runId}/{shardIndex}`, with the run id as one encoded segment.
    pub fn shard_endpoint(&self, run_id: &str, shard_index: u32) -> Url {
        endpoint(&self.base_url, &["shards", run_id, &shard_index.to_string()])
    }
}

fn parse_base(raw: &str) -> Result<Url, CollectorError> {
    let invalid = |reason: String| CollectorError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid("not a base url".to_string()));
    }
    Ok(url)
}

/// Append `segments` to `base`, percent-encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

fn check_status(endpoint: &str, resp: &reqwest::Response) -> Result<(), CollectorError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(CollectorError::Status {
            endpoint: endpoint.to_string(),
            status: resp.status().as_u16(),
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn update_shard_status(&self, status: &ShardStatus) -> Result<(), CollectorError> {
        let url = self.shard_endpoint(&status.run_id, status.shard_index);
        let endpoint = url.to_string();
        let resp = self
            .client
            .patch(url)
            .json(&ShardStatusBody::from(status))
            .send()
            .await
            .map_err(|source| CollectorError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;
        check_status(&endpoint, &resp)?;
        debug!(run_id = %status.run_id, shard = status.shard_index, status = %status.status, "shard status sent");
        Ok(())
    }

    async fn record_healing_event(&self, event: &HealingEvent) -> Result<(), CollectorError> {
        let url = endpoint(&self.base_url, &["healing", "events"]);
        let endpoint = url.to_string();
        let resp = self
            .client
            .post(url)
            .header("X-Tenant-ID", &event.tenant_id)
            .json(event)
            .send()
            .await
            .map_err(|source| CollectorError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;
        check_status(&endpoint, &resp)
    }
}

#[async_trait]
impl ArtifactStore for HttpCollector {
    async fn upload(&self, upload: &ArtifactUpload) -> Result<String, CollectorError> {
        let url = endpoint(&self.artifact_url, &["artifacts", "upload"]);
        let endpoint = url.to_string();
        let body = tokio::fs::read(&upload.path)
            .await
            .map_err(|source| CollectorError::ArtifactRead {
                path: upload.path.clone(),
                source,
            })?;

        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/octet-stream")
            .header("X-Run-ID", &upload.run_id)
            .header("X-Tenant-ID", &upload.tenant_id)
            .header("X-Artifact-Type", upload.kind.as_str())
            .header("X-Artifact-Name", &upload.name)
            .body(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|source| CollectorError::Request {
            endpoint: endpoint.clone(),
            source,
        })?;
        check_status(&endpoint, &resp)?;

        let parsed: UploadResponse = resp.json().await.map_err(|source| CollectorError::Request {
            endpoint: endpoint.clone(),
            source,
        })?;
        parsed.url.ok_or(CollectorError::MissingUrl { endpoint })
    }
}
