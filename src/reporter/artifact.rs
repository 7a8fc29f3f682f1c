//! Attachment upload ahead of emitting a result record.

use tracing::{debug, warn};

use super::wire::TestResultRecord;
use crate::collector::{ArtifactKind, ArtifactStore, ArtifactUpload};
use crate::runner::Attachment;

impl TestResultRecord {
    /// Set the URL field for `kind`. Unknown kinds have no field.
    pub fn set_artifact_url(&mut self, kind: ArtifactKind, url: String) {
        match kind {
            ArtifactKind::Trace => self.trace_url = Some(url),
            ArtifactKind::Screenshot => self.screenshot_url = Some(url),
            ArtifactKind::Video => self.video_url = Some(url),
            ArtifactKind::Unknown => {}
        }
    }
}

/// Upload each attachment that has a file on disk and record the URLs.
///
/// A failed upload leaves its URL unset; the remaining attachments are still
/// tried.
pub async fn upload_attachments(
    store: &dyn ArtifactStore,
    tenant_id: &str,
    attachments: &[Attachment],
    record: &mut TestResultRecord,
) {
    for attachment in attachments {
        let Some(path) = &attachment.path else {
            debug!(name = %attachment.name, "attachment has no file, skipping upload");
            continue;
        };
        let kind = ArtifactKind::classify(&attachment.name);
        let upload = ArtifactUpload {
            run_id: record.run_id.clone(),
            tenant_id: tenant_id.to_string(),
            kind,
            name: attachment.name.clone(),
            path: path.clone(),
        };
        match store.upload(&upload).await {
            Ok(url) => record.set_artifact_url(kind, url),
            Err(e) => warn!(
                run_id = %record.run_id,
                test = %record.test_name,
                artifact = %attachment.name,
                error = %e,
                "artifact upload failed"
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::testing::MemoryStore;
    use super::*;
    use crate::reporter::wire::RecordStatus;

    fn record() -> TestResultRecord {
        TestResultRecord {
            run_id: "run-1".to_string(),
            test_file: "a.spec.ts".to_string(),
            test_name: "works".to_string(),
            test_title: "works".to_string(),
            shard_index: 0,
            worker_id: "worker-1".to_string(),
            status: RecordStatus::Failed,
            duration_ms: 10,
            retry_count: 0,
            error_message: None,
            error_stack: None,
            trace_url: None,
            screenshot_url: None,
            video_url: None,
            metadata: serde_json::Value::Null,
            timestamp: chrono::Utc::now(),
        }
    }

    fn attachment(name: &str, path: Option<&str>) -> Attachment {
        Attachment {
            name: name.to_string(),
            path: path.map(PathBuf::from),
            content_type: None,
        }
    }

    #[tokio::test]
    async fn test_urls_filled_by_kind() {
        let store = MemoryStore::default();
        let mut rec = record();
        upload_attachments(
            &store,
            "tenant-a",
            &[
                attachment("trace", Some("/tmp/trace.zip")),
                attachment("screenshot", Some("/tmp/s.png")),
                attachment("stdout", Some("/tmp/out.txt")),
                attachment("video", None),
            ],
            &mut rec,
        )
        .await;

        assert_eq!(rec.trace_url.as_deref(), Some("memory://trace/trace"));
        assert_eq!(rec.screenshot_url.as_deref(), Some("memory://screenshot/screenshot"));
        assert_eq!(rec.video_url, None);

        let uploads = store.uploads.lock().unwrap();
        // Path-less attachments are never uploaded; unknown ones are.
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[2].kind, ArtifactKind::Unknown);
        assert_eq!(uploads[0].tenant_id, "tenant-a");
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_url_absent() {
        let store = MemoryStore {
            reject: vec!["trace".to_string()],
            ..Default::default()
        };
        let mut rec = record();
        upload_attachments(
            &store,
            "tenant-a",
            &[
                attachment("trace", Some("/tmp/trace.zip")),
                attachment("video", Some("/tmp/v.webm")),
            ],
            &mut rec,
        )
        .await;

        assert_eq!(rec.trace_url, None);
        assert_eq!(rec.video_url.as_deref(), Some("memory://video/video"));
    }
}
