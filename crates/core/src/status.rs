//! Ephemeral per-document progress and its throttled broadcast to listeners.

use crate::models::DocumentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Queued,
    Parsing,
    OcrFallback,
    Chunking,
    Embedding,
    Indexing,
    Completed,
    Failed,
    Blacklisted,
}

impl IngestStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blacklisted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub filename: String,
    pub stage: IngestStage,
    /// Human readable label, e.g. `Parsing PDF (3/10)`.
    pub status: String,
    pub progress: f64,
    pub page_current: u32,
    pub page_total: u32,
}

impl ProcessingStatus {
    pub fn queued(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            stage: IngestStage::Queued,
            status: "Queued".to_string(),
            progress: 0.0,
            page_current: 0,
            page_total: 0,
        }
    }

    /// Moves to `stage`. Progress never goes backwards.
    pub fn advance(&mut self, stage: IngestStage, label: impl Into<String>, progress: f64) {
        self.stage = stage;
        self.status = label.into();
        self.progress = self.progress.max(progress.clamp(0.0, 100.0));
    }

    pub fn pages(&mut self, current: u32, total: u32) {
        self.page_current = current;
        self.page_total = total;
    }
}

/// In-memory status per document, shared by the pipeline and the supervisor.
#[derive(Debug, Default)]
pub struct StatusBoard {
    statuses: Mutex<HashMap<DocumentId, ProcessingStatus>>,
}

impl StatusBoard {
    fn statuses(&self) -> MutexGuard<'_, HashMap<DocumentId, ProcessingStatus>> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, document_id: DocumentId, status: ProcessingStatus) {
        self.statuses().insert(document_id, status);
    }

    /// Applies `change` to the document's status, starting from `Queued` if there is none,
    /// and returns the result.
    pub fn update(
        &self,
        document_id: DocumentId,
        filename: &str,
        change: impl FnOnce(&mut ProcessingStatus),
    ) -> ProcessingStatus {
        let mut statuses = self.statuses();
        let status = statuses
            .entry(document_id)
            .or_insert_with(|| ProcessingStatus::queued(filename));
        change(status);
        status.clone()
    }

    pub fn get(&self, document_id: DocumentId) -> Option<ProcessingStatus> {
        self.statuses().get(&document_id).cloned()
    }

    pub fn remove(&self, document_id: DocumentId) -> Option<ProcessingStatus> {
        self.statuses().remove(&document_id)
    }

    pub fn snapshot(&self) -> Vec<(DocumentId, ProcessingStatus)> {
        let mut entries = self
            .statuses()
            .iter()
            .map(|(id, status)| (*id, status.clone()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingEvent {
    ProcessingUpdate {
        filename: String,
        status: ProcessingStatus,
    },
}

pub trait NotificationSink: Send + Sync {
    fn broadcast(&self, event: ProcessingEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn broadcast(&self, _event: ProcessingEvent) {}
}

/// Fans events out to every subscriber. Nobody listening is fine.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<ProcessingEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingEvent> {
        self.sender.subscribe()
    }
}

impl NotificationSink for ChannelSink {
    fn broadcast(&self, event: ProcessingEvent) {
        let _ = self.sender.send(event);
    }
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    stage: IngestStage,
    progress: f64,
    at: Instant,
}

pub const DEFAULT_MIN_PROGRESS_DELTA: f64 = 0.2;
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Throttles status broadcasts per document: an update goes out when the stage changed,
/// progress moved far enough, or enough time passed. Terminal updates always go out.
pub struct StatusEmitter {
    sink: Arc<dyn NotificationSink>,
    markers: Mutex<HashMap<DocumentId, Marker>>,
    min_progress_delta: f64,
    min_interval: Duration,
}

impl StatusEmitter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            markers: Mutex::new(HashMap::new()),
            min_progress_delta: DEFAULT_MIN_PROGRESS_DELTA,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }

    pub fn with_thresholds(mut self, min_progress_delta: f64, min_interval: Duration) -> Self {
        self.min_progress_delta = min_progress_delta;
        self.min_interval = min_interval;
        self
    }

    /// Returns whether the update was broadcast.
    pub fn emit(&self, document_id: DocumentId, status: &ProcessingStatus) -> bool {
        let now = Instant::now();
        {
            let mut markers = self
                .markers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if status.stage.is_terminal() {
                markers.remove(&document_id);
            } else {
                if let Some(previous) = markers.get(&document_id) {
                    let unchanged = previous.stage == status.stage
                        && (status.progress - previous.progress).abs() < self.min_progress_delta
                        && now.duration_since(previous.at) < self.min_interval;
                    if unchanged {
                        return false;
                    }
                }
                markers.insert(
                    document_id,
                    Marker {
                        stage: status.stage,
                        progress: status.progress,
                        at: now,
                    },
                );
            }
        }

        debug!(
            document_id,
            filename = %status.filename,
            stage = ?status.stage,
            progress = status.progress,
            "broadcasting processing status"
        );
        self.sink.broadcast(ProcessingEvent::ProcessingUpdate {
            filename: status.filename.clone(),
            status: status.clone(),
        });
        true
    }

    pub fn clear(&self, document_id: DocumentId) {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;

    fn status(stage: IngestStage, progress: f64) -> ProcessingStatus {
        let mut status = ProcessingStatus::queued("manual.pdf");
        status.advance(stage, format!("{stage:?}"), progress);
        status
    }

    #[test]
    fn small_progress_steps_within_a_stage_are_throttled() {
        let sink = Arc::new(RecordingSink::default());
        let emitter = StatusEmitter::new(sink.clone());

        assert!(emitter.emit(1, &status(IngestStage::Parsing, 10.0)));
        assert!(!emitter.emit(1, &status(IngestStage::Parsing, 10.1)));
        assert!(emitter.emit(1, &status(IngestStage::Parsing, 10.3)));
        assert!(emitter.emit(1, &status(IngestStage::Embedding, 10.3)));
        // Markers are per document.
        assert!(emitter.emit(2, &status(IngestStage::Parsing, 10.1)));

        assert_eq!(sink.events().len(), 4);
    }

    #[test]
    fn elapsed_interval_allows_an_unchanged_update() {
        let emitter = StatusEmitter::new(Arc::new(NullSink))
            .with_thresholds(DEFAULT_MIN_PROGRESS_DELTA, Duration::from_millis(10));

        assert!(emitter.emit(1, &status(IngestStage::Parsing, 5.0)));
        assert!(!emitter.emit(1, &status(IngestStage::Parsing, 5.0)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(emitter.emit(1, &status(IngestStage::Parsing, 5.0)));
    }

    #[test]
    fn terminal_updates_always_emit_and_reset_the_marker() {
        let emitter = StatusEmitter::new(Arc::new(NullSink));

        assert!(emitter.emit(1, &status(IngestStage::Completed, 100.0)));
        assert!(emitter.emit(1, &status(IngestStage::Completed, 100.0)));
        assert!(emitter.emit(1, &status(IngestStage::Parsing, 1.0)));
        emitter.clear(1);
        assert!(emitter.emit(1, &status(IngestStage::Parsing, 1.0)));
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut status = status(IngestStage::Parsing, 40.0);
        status.advance(IngestStage::Embedding, "Generating embeddings", 10.0);
        assert_eq!(status.progress, 40.0);
        assert_eq!(status.stage, IngestStage::Embedding);
    }

    #[test]
    fn events_serialize_with_a_type_tag() -> Result<(), serde_json::Error> {
        let event = ProcessingEvent::ProcessingUpdate {
            filename: "manual.pdf".to_string(),
            status: ProcessingStatus::queued("manual.pdf"),
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(json["type"], "processing_update");
        assert_eq!(json["filename"], "manual.pdf");
        assert_eq!(json["status"]["status"], "Queued");
        Ok(())
    }

    #[tokio::test]
    async fn channel_sink_delivers_to_subscribers() {
        let sink = ChannelSink::new(8);
        sink.broadcast(ProcessingEvent::ProcessingUpdate {
            filename: "nobody-listening.pdf".to_string(),
            status: ProcessingStatus::queued("nobody-listening.pdf"),
        });

        let mut receiver = sink.subscribe();
        sink.broadcast(ProcessingEvent::ProcessingUpdate {
            filename: "manual.pdf".to_string(),
            status: ProcessingStatus::queued("manual.pdf"),
        });
        let ProcessingEvent::ProcessingUpdate { filename, .. } =
            receiver.recv().await.expect("event delivered");
        assert_eq!(filename, "manual.pdf");
    }
}
