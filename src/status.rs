use crate::clients::http_client;
use crate::config::ServiceEndpoint;
use crate::stages::Stage;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub source: String,
    pub category: String,
    pub severity: String,
    pub status: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl StatusUpdate {
    /// Video progress card for `video_file` at the start of `stage`.
    pub fn stage_progress(video_file: &str, stage: Stage) -> Self {
        StatusUpdate {
            source: "pipeline".to_string(),
            category: "Video".to_string(),
            severity: "Card".to_string(),
            status: "In Progress".to_string(),
            message: format!("Processing {}.", video_file),
            details: serde_json::json!({
                "video_file": video_file,
                "stage": stage.name(),
                "progress": format!("{}%", stage.progress()),
            }),
        }
    }

    pub fn completed(video_file: &str) -> Self {
        StatusUpdate {
            source: "pipeline".to_string(),
            category: "Video".to_string(),
            severity: "Card".to_string(),
            status: "Complete".to_string(),
            message: format!("Processed {}.", video_file),
            details: serde_json::json!({
                "video_file": video_file,
                "stage": "Complete",
                "progress": "100%",
            }),
        }
    }

    pub fn failed(video_file: &str, stage: Stage, error: &str) -> Self {
        StatusUpdate {
            source: "pipeline".to_string(),
            category: "Video".to_string(),
            severity: "Error".to_string(),
            status: "Failed".to_string(),
            message: format!("Failed to process {}: {}", video_file, error),
            details: serde_json::json!({
                "video_file": video_file,
                "stage": stage.name(),
            }),
        }
    }
}

#[async_trait]
pub trait StatusTransport: Send + Sync {
    async fn deliver(&self, update: &StatusUpdate) -> Result<()>;
}

/// POSTs each update as JSON.
pub struct HttpStatusTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpStatusTransport {
    pub fn new(cfg: &ServiceEndpoint) -> Result<Self> {
        Ok(HttpStatusTransport { client: http_client()?, endpoint: cfg.endpoint.clone(), api_key: cfg.api_key() })
    }
}

#[async_trait]
impl StatusTransport for HttpStatusTransport {
    async fn deliver(&self, update: &StatusUpdate) -> Result<()> {
        let mut req = self.client.post(&self.endpoint).json(update);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Writes updates to the log when no sink endpoint is configured.
pub struct LogTransport;

#[async_trait]
impl StatusTransport for LogTransport {
    async fn deliver(&self, update: &StatusUpdate) -> Result<()> {
        tracing::info!(
            status = %update.status,
            category = %update.category,
            details = %update.details,
            "{}",
            update.message
        );
        Ok(())
    }
}

/// Non-blocking front end to a status transport.
///
/// `notify` never waits: updates go into a bounded queue drained by a
/// background task, and are dropped when the queue is full.
#[derive(Clone)]
pub struct StatusReporter {
    tx: mpsc::Sender<StatusUpdate>,
}

impl StatusReporter {
    pub fn spawn(transport: Arc<dyn StatusTransport>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StatusUpdate>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = transport.deliver(&update).await {
                    tracing::warn!("status delivery failed: {:#}", e);
                }
            }
            tracing::debug!("status reporter drained");
        });
        (StatusReporter { tx }, handle)
    }

    pub fn notify(&self, update: StatusUpdate) {
        if let Err(e) = self.tx.try_send(update) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "reporter closed",
            };
            tracing::warn!("status update dropped: {}", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl StatusTransport for Recording {
        async fn deliver(&self, update: &StatusUpdate) -> Result<()> {
            self.seen.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    /// Blocks every delivery until released.
    struct Stalled {
        release: Notify,
    }

    #[async_trait]
    impl StatusTransport for Stalled {
        async fn deliver(&self, _update: &StatusUpdate) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl StatusTransport for Failing {
        async fn deliver(&self, _update: &StatusUpdate) -> Result<()> {
            Err(anyhow::anyhow!("sink offline"))
        }
    }

    #[tokio::test]
    async fn test_updates_are_delivered_in_order() {
        let transport = Arc::new(Recording::default());
        let (reporter, handle) = StatusReporter::spawn(transport.clone(), 8);
        reporter.notify(StatusUpdate::stage_progress("drive.mp4", Stage::Metadata));
        reporter.notify(StatusUpdate::completed("drive.mp4"));
        drop(reporter);
        handle.await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].details["progress"], "20%");
        assert_eq!(seen[0].details["stage"], "Metadata");
        assert_eq!(seen[1].details["progress"], "100%");
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks() {
        let transport = Arc::new(Stalled { release: Notify::new() });
        let (reporter, _handle) = StatusReporter::spawn(transport.clone(), 2);

        let notified = tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..50 {
                reporter.notify(StatusUpdate::completed("drive.mp4"));
            }
        })
        .await;
        assert!(notified.is_ok());
        transport.release.notify_waiters();
    }

    #[tokio::test]
    async fn test_transport_errors_are_swallowed() {
        let (reporter, handle) = StatusReporter::spawn(Arc::new(Failing), 4);
        reporter.notify(StatusUpdate::failed("drive.mp4", Stage::FrameExtraction, "ffmpeg exited"));
        drop(reporter);
        assert!(handle.await.is_ok());
    }

    #[test]
    fn test_failed_update_names_stage() {
        let update = StatusUpdate::failed("drive.mp4", Stage::AiAnalysis, "boom");
        assert_eq!(update.status, "Failed");
        assert_eq!(update.details["stage"], "AI Analysis");
    }
}
