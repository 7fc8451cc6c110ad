use crate::chunking::{prepare_chunks, ChunkingConfig};
use crate::embeddings::embed_on_blocking_pool;
use crate::error::{IngestError, StoreError};
use crate::extractor::{ExtractionEngine, ExtractionOutcome, ExtractionProgress};
use crate::models::{Document, DocumentId, RecordFilter, RecordSelector};
use crate::records::RecordStore;
use crate::status::{IngestStage, NotificationSink, ProcessingStatus, StatusBoard, StatusEmitter};
use crate::vector_store::VectorStore;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PARSING_SHARE: f64 = 50.0;
const OCR_START: f64 = 50.0;
const OCR_END: f64 = 70.0;
const INDEXING_PROGRESS: f64 = 75.0;

pub const CANCELLED_ERROR: &str = "Processing was cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed { chunks: usize },
    Failed { reason: String },
    Blacklisted { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub document_id: DocumentId,
    pub outcome: IngestOutcome,
    /// Last status broadcast for the run; it is no longer on the board.
    pub status: ProcessingStatus,
}

/// Writes stage changes to the status board, the notifier and (best effort) the record store.
#[derive(Clone)]
struct StageReporter {
    document_id: DocumentId,
    filename: String,
    records: Arc<dyn RecordStore>,
    statuses: Arc<StatusBoard>,
    emitter: Arc<StatusEmitter>,
}

impl StageReporter {
    fn advance(&self, stage: IngestStage, label: impl Into<String>, progress: f64) -> ProcessingStatus {
        self.update(|status| status.advance(stage, label, progress))
    }

    fn update(&self, change: impl FnOnce(&mut ProcessingStatus)) -> ProcessingStatus {
        let status = self.statuses.update(self.document_id, &self.filename, change);
        self.emitter.emit(self.document_id, &status);
        if !status.stage.is_terminal() {
            if let Err(error) = self.records.update_progress(self.document_id, status.progress) {
                warn!(document_id = self.document_id, %error, "failed to persist progress");
            }
        }
        status
    }

    fn extraction(&self, progress: ExtractionProgress) {
        match progress {
            ExtractionProgress::Parsing { current, total } => {
                let percent = f64::from(current) / f64::from(total.max(1)) * PARSING_SHARE;
                self.update(|status| {
                    status.advance(
                        IngestStage::Parsing,
                        format!("Parsing PDF ({current}/{total})"),
                        percent,
                    );
                    status.pages(current, total);
                });
            }
            ExtractionProgress::Ocr { current, total } => {
                let percent = (OCR_START
                    + f64::from(current) / f64::from(total.max(1)) * (OCR_END - OCR_START))
                    .min(OCR_END);
                self.update(|status| {
                    status.advance(
                        IngestStage::OcrFallback,
                        format!("Running OCR ({current}/{total})"),
                        percent,
                    );
                    status.pages(current, total);
                });
            }
        }
    }
}

/// Runs one document through extraction, chunking, embedding and indexing, keeping the
/// record and the broadcast status in step.
pub struct IngestionPipeline {
    records: Arc<dyn RecordStore>,
    vectors: Arc<VectorStore>,
    extraction: Arc<ExtractionEngine>,
    chunking: ChunkingConfig,
    statuses: Arc<StatusBoard>,
    emitter: Arc<StatusEmitter>,
}

impl IngestionPipeline {
    pub fn new(
        records: Arc<dyn RecordStore>,
        vectors: Arc<VectorStore>,
        extraction: ExtractionEngine,
        chunking: ChunkingConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::with_emitter(records, vectors, extraction, chunking, StatusEmitter::new(sink))
    }

    pub fn with_emitter(
        records: Arc<dyn RecordStore>,
        vectors: Arc<VectorStore>,
        extraction: ExtractionEngine,
        chunking: ChunkingConfig,
        emitter: StatusEmitter,
    ) -> Self {
        Self {
            records,
            vectors,
            extraction: Arc::new(extraction),
            chunking,
            statuses: Arc::new(StatusBoard::default()),
            emitter: Arc::new(emitter),
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn vectors(&self) -> &Arc<VectorStore> {
        &self.vectors
    }

    pub fn statuses(&self) -> &Arc<StatusBoard> {
        &self.statuses
    }

    pub fn emitter(&self) -> &Arc<StatusEmitter> {
        &self.emitter
    }

    fn reporter(&self, document_id: DocumentId, filename: &str) -> StageReporter {
        StageReporter {
            document_id,
            filename: filename.to_string(),
            records: Arc::clone(&self.records),
            statuses: Arc::clone(&self.statuses),
            emitter: Arc::clone(&self.emitter),
        }
    }

    /// Puts a document on the board as `Queued` and announces it.
    pub fn mark_queued(&self, document_id: DocumentId, filename: &str) {
        let status = ProcessingStatus::queued(filename);
        self.statuses.set(document_id, status.clone());
        self.emitter.emit(document_id, &status);
    }

    /// Releases a queued document that will not run after all.
    pub fn cancel_queued(&self, document_id: DocumentId) -> Result<(), StoreError> {
        self.statuses.remove(document_id);
        self.emitter.clear(document_id);

        let Some(mut document) = self.records.get_document(document_id)? else {
            return Ok(());
        };
        document.processing = false;
        document.error = Some(CANCELLED_ERROR.to_string());
        self.records.update_document(&document)
    }

    /// Fire-and-forget variant of [`process`](Self::process) for upload triggers.
    pub fn submit(
        self: &Arc<Self>,
        document_id: DocumentId,
        file_path: PathBuf,
        display_name: String,
    ) -> JoinHandle<Result<IngestReport, IngestError>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.process(document_id, &file_path, &display_name).await })
    }

    /// Processes one document to a terminal state. Document-level failures are reported in
    /// the outcome; `Err` means the record could not be read or written, or the document is
    /// blacklisted and only an explicit un-blacklist may admit it again.
    pub async fn process(
        &self,
        document_id: DocumentId,
        file_path: &Path,
        display_name: &str,
    ) -> Result<IngestReport, IngestError> {
        let mut document = self
            .records
            .get_document(document_id)?
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        if document.blacklisted {
            if document.processing {
                document.processing = false;
                self.records.update_document(&document)?;
            }
            self.statuses.remove(document_id);
            return Err(IngestError::InvalidArgument(format!(
                "{} is blacklisted",
                document.filename
            )));
        }

        info!(document_id, filename = %display_name, path = %file_path.display(), "processing document");
        document.processing = true;
        document.processed = false;
        document.error = None;
        document.progress = 0.0;
        self.records.update_document(&document)?;

        let reporter = self.reporter(document_id, display_name);
        reporter.update(|status| {
            *status = ProcessingStatus::queued(display_name);
            status.advance(IngestStage::Parsing, "Processing", 0.0);
        });

        let outcome = match self.run(&mut document, file_path, &reporter).await {
            Ok(outcome) => outcome,
            Err(error) => IngestOutcome::Failed {
                reason: error.to_string(),
            },
        };

        let status = self.finish(&mut document, &outcome, &reporter)?;
        Ok(IngestReport {
            document_id,
            outcome,
            status,
        })
    }

    async fn run(
        &self,
        document: &mut Document,
        file_path: &Path,
        reporter: &StageReporter,
    ) -> Result<IngestOutcome, IngestError> {
        if !file_path.is_file() {
            return Err(IngestError::MissingFile(file_path.display().to_string()));
        }

        let document_id = document.id;
        self.records.delete_pages(document_id)?;
        let stale = self
            .vectors
            .delete(&RecordSelector::Filter(RecordFilter::document(document_id)))
            .await?;
        if stale > 0 {
            info!(document_id, records = stale, "removed vector records of the previous version");
        }
        reporter.advance(IngestStage::Parsing, "Parsing PDF", 0.0);

        let engine = Arc::clone(&self.extraction);
        let progress = reporter.clone();
        let path = file_path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || {
            engine.extract(&path, &mut |step| progress.extraction(step))
        })
        .await??;

        let extracted = match outcome {
            ExtractionOutcome::Text(extracted) => extracted,
            ExtractionOutcome::Empty { page_count, reason } => {
                document.page_count = page_count;
                return Ok(IngestOutcome::Blacklisted { reason });
            }
        };
        document.page_count = extracted.page_count;

        let pages = extracted.page_texts(document_id);
        self.records.insert_pages(&pages)?;

        let current = reporter.statuses.get(document_id).map_or(0.0, |status| status.progress);
        reporter.advance(IngestStage::Chunking, "Splitting text", current);
        let text = extracted.document_text(document_id)?;
        let prepared = prepare_chunks(document_id, &document.filename, &text, self.chunking, None);
        info!(
            document_id,
            chunks = prepared.len(),
            images = extracted.image_count(),
            ocr = extracted.used_ocr,
            "text split into chunks"
        );
        if prepared.is_empty() {
            return Err(IngestError::EmptyChunks);
        }

        let total = extracted.page_count;
        reporter.update(|status| {
            status.advance(IngestStage::Embedding, "Generating embeddings", current);
            status.pages(total, total);
        });
        let vectors = embed_on_blocking_pool(self.vectors.embedder(), prepared.texts.clone()).await?;

        reporter.advance(IngestStage::Indexing, "Storing in vector database", INDEXING_PROGRESS);
        let added = self
            .vectors
            .add(&prepared.texts, &vectors, &prepared.metadatas)
            .await?;
        if added.failed_batches > 0 {
            warn!(
                document_id,
                failed_batches = added.failed_batches,
                "some vector batches were not stored"
            );
        }

        Ok(IngestOutcome::Completed {
            chunks: prepared.len(),
        })
    }

    fn finish(
        &self,
        document: &mut Document,
        outcome: &IngestOutcome,
        reporter: &StageReporter,
    ) -> Result<ProcessingStatus, StoreError> {
        let document_id = document.id;
        let total = document.page_count;
        document.processing = false;

        let status = match outcome {
            IngestOutcome::Completed { chunks } => {
                info!(document_id, chunks, "document processed");
                document.processed = true;
                document.processed_at = Some(Utc::now());
                document.chunk_count = *chunks as u32;
                document.error = None;
                reporter.update(|status| {
                    status.advance(IngestStage::Completed, "Completed", 100.0);
                    status.pages(total, total);
                })
            }
            IngestOutcome::Blacklisted { reason } => {
                warn!(document_id, %reason, "document blacklisted");
                document.processed = false;
                document.blacklisted = true;
                document.blacklisted_at = Some(Utc::now());
                document.blacklist_reason = Some(reason.clone());
                document.error = Some(reason.clone());
                reporter.advance(IngestStage::Blacklisted, "Blacklisted", 0.0)
            }
            IngestOutcome::Failed { reason } => {
                error!(document_id, %reason, "document processing failed");
                document.processed = false;
                document.error = Some(reason.clone());
                reporter.advance(IngestStage::Failed, format!("Error: {reason}"), 0.0)
            }
        };
        document.progress = status.progress;

        self.statuses.remove(document_id);
        self.records.update_document(document)?;
        Ok(status)
    }
}
