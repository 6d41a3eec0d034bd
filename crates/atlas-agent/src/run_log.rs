use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use atlas_core::event::EventBus;
use atlas_core::types::{RequestId, TelemetryEvent};

/// JSONL traversal logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single request. Append-only, flushed per line, so a crash mid-run still
/// leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a TelemetryEvent,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs are written to
    /// `{log_dir}/{request_id}/{timestamp}.jsonl`.
    /// `level`: 1 = summary, 2 = stages and retries, 3 = every node.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task until the request's
    /// traversal ends or `cancel` fires. Subscribing before spawning means
    /// no event published after this call is missed.
    pub fn attach(
        self,
        event_bus: &Arc<EventBus>,
        request_id: RequestId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, request_id, cancel))
    }

    async fn run(
        self,
        mut rx: broadcast::Receiver<TelemetryEvent>,
        request_id: RequestId,
        cancel: CancellationToken,
    ) {
        let dir = self.log_dir.join(&request_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.request_id() != &request_id || !self.wants(&event) {
                                continue;
                            }
                            let entry = LogEntry {
                                timestamp: Utc::now().to_rfc3339(),
                                event: &event,
                            };
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Level filter.
    fn wants(&self, event: &TelemetryEvent) -> bool {
        let required = match event {
            TelemetryEvent::TraversalStarted { .. }
            | TelemetryEvent::TraversalCompleted { .. }
            | TelemetryEvent::TraversalFailed { .. }
            | TelemetryEvent::CheckpointFailed { .. } => 1,
            TelemetryEvent::StageTransition { .. }
            | TelemetryEvent::RetryScheduled { .. }
            | TelemetryEvent::DegradedPass { .. }
            | TelemetryEvent::TokensUsed { .. } => 2,
            TelemetryEvent::NodeStarted { .. } | TelemetryEvent::NodeFinished { .. } => 3,
        };
        self.level >= required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::types::Stage;

    fn started(id: &str) -> TelemetryEvent {
        TelemetryEvent::TraversalStarted {
            request_id: RequestId::from_str(id),
        }
    }

    #[test]
    fn test_entry_flattens_event() {
        let event = started("r1");
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            event: &event,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event"], "traversal_started");
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["timestamp"], "2026-02-24T12:00:00Z");
    }

    #[test]
    fn test_event_level_filtering() {
        let node_event = TelemetryEvent::NodeStarted {
            request_id: RequestId::from_str("r1"),
            node: "classifier".into(),
            stage: Stage::Classifying,
            attempt: 0,
        };
        let summary = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(summary.wants(&started("r1")));
        assert!(!summary.wants(&node_event));
        assert!(RunLogger::new(PathBuf::from("/tmp"), 3).wants(&node_event));
    }

    #[tokio::test]
    async fn test_writes_only_own_request_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let handle = RunLogger::new(dir.path().to_path_buf(), 2).attach(
            &bus,
            RequestId::from_str("r1"),
            CancellationToken::new(),
        );

        bus.publish(started("r1"));
        bus.publish(started("other"));
        bus.publish(TelemetryEvent::TraversalCompleted {
            request_id: RequestId::from_str("r1"),
            elapsed_ms: 12,
        });
        handle.await.unwrap();

        let mut entries = std::fs::read_dir(dir.path().join("r1")).unwrap();
        let path = entries.next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("traversal_started"));
        assert!(lines[1].contains("traversal_completed"));
    }
}
