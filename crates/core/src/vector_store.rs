use crate::chunking::{prepare_chunks, ChunkingConfig, DocumentText};
use crate::config::IngestConfig;
use crate::embeddings::{embed_on_blocking_pool, Embedder};
use crate::error::{IndexError, IngestError};
use crate::models::{
    DocumentFilter, RecordFilter, RecordMetadata, RecordSelector, SearchPage, VectorRecord,
};
use crate::records::RecordStore;
use crate::stores::{open_index, Recovery};
use crate::traits::VectorIndex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const ADD_BATCH_SIZE: usize = 100;
const REBUILD_BATCH_PREFIX: &str = "rebuild";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddReport {
    pub inserted: usize,
    pub failed_batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStatus {
    Completed,
    /// The index already had records, nothing was touched.
    NotEmpty,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub status: RebuildStatus,
    pub documents: usize,
    pub chunks: usize,
    pub skipped_documents: usize,
    pub failed_documents: usize,
}

impl RebuildReport {
    fn with_status(status: RebuildStatus) -> Self {
        Self {
            status,
            documents: 0,
            chunks: 0,
            skipped_documents: 0,
            failed_documents: 0,
        }
    }
}

/// Clears the in-flight flag however the rebuild ends.
struct RebuildGuard<'a>(&'a AtomicBool);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Process-wide entry point to the vector index.
pub struct VectorStore {
    index: Arc<dyn VectorIndex>,
    records: Arc<dyn RecordStore>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    rebuilding: AtomicBool,
}

impl VectorStore {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        records: Arc<dyn RecordStore>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            index,
            records,
            embedder,
            chunking,
            rebuilding: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.index.backend()
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// Stores chunk vectors under ids derived from their metadata. Existing records with
    /// the same ids are replaced. Batches that fail are logged and skipped; the call only
    /// fails when the input is invalid or nothing could be written.
    pub async fn add(
        &self,
        texts: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[RecordMetadata],
    ) -> Result<AddReport, IndexError> {
        if texts.len() != vectors.len() || texts.len() != metadatas.len() {
            return Err(IndexError::InvalidInput(format!(
                "{} texts, {} vectors and {} metadatas do not line up",
                texts.len(),
                vectors.len(),
                metadatas.len()
            )));
        }

        let dimensions = self.embedder.dimensions();
        if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimensions) {
            return Err(IndexError::InvalidInput(format!(
                "embedding dimension {} != {dimensions}",
                vector.len()
            )));
        }

        let records = texts
            .iter()
            .zip(vectors)
            .zip(metadatas)
            .map(|((text, vector), metadata)| VectorRecord {
                id: metadata.record_id(),
                text: text.clone(),
                vector: vector.clone(),
                metadata: metadata.clone(),
            })
            .collect::<Vec<_>>();

        let mut report = AddReport::default();
        for (batch_number, batch) in records.chunks(ADD_BATCH_SIZE).enumerate() {
            let ids = batch.iter().map(|record| record.id.clone()).collect();
            if let Err(error) = self.index.delete(&RecordSelector::Ids(ids)).await {
                warn!(batch_number, %error, "failed to clear existing ids before insert");
            }

            match self.index.insert(batch).await {
                Ok(inserted) => report.inserted += inserted,
                Err(error) => {
                    error!(batch_number, size = batch.len(), %error, "vector batch insert failed");
                    report.failed_batches += 1;
                }
            }
        }

        if report.inserted == 0 && report.failed_batches > 0 {
            return Err(IndexError::BackendResponse {
                backend: self.backend().to_string(),
                details: format!("all {} batches failed to insert", report.failed_batches),
            });
        }

        debug!(
            inserted = report.inserted,
            failed_batches = report.failed_batches,
            "vector records added"
        );
        Ok(report)
    }

    /// One page of results. Fetches one extra hit to know whether another page exists.
    pub async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Option<&RecordFilter>,
        offset: usize,
    ) -> Result<SearchPage, IndexError> {
        if limit == 0 {
            return Ok(SearchPage::empty(offset, limit));
        }

        let fetch = offset + limit + 1;
        let hits = self.index.search(query, fetch, filter).await?;
        let total_fetched = hits.len();

        Ok(SearchPage {
            hits: hits.into_iter().skip(offset).take(limit).collect(),
            has_more: total_fetched > offset + limit,
            offset,
            limit,
            total_fetched,
        })
    }

    pub async fn search_text(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&RecordFilter>,
        offset: usize,
    ) -> Result<SearchPage, IngestError> {
        let vector = embed_on_blocking_pool(&self.embedder, vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IngestError::Embedding("embedder returned no vector".to_string()))?;
        Ok(self.search(&vector, limit, filter, offset).await?)
    }

    pub async fn count(&self) -> Result<usize, IndexError> {
        self.index.count().await
    }

    pub async fn delete(&self, selector: &RecordSelector) -> Result<usize, IndexError> {
        if let RecordSelector::Filter(filter) = selector {
            if filter.is_empty() {
                return Err(IndexError::InvalidInput(
                    "refusing to delete with an empty filter".to_string(),
                ));
            }
        }
        self.index.delete(selector).await
    }

    /// Drops every record, then restores what it can from stored page text.
    pub async fn reset(self: &Arc<Self>) -> Result<(), IndexError> {
        self.index.reset().await?;
        warn!(backend = self.backend(), "vector index reset");
        self.ensure_async_rebuild();
        Ok(())
    }

    /// Re-derives the index from stored page text when it is empty. At most one rebuild runs
    /// per process.
    pub async fn rebuild(&self) -> Result<RebuildReport, IngestError> {
        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("vector rebuild already running");
            return Ok(RebuildReport::with_status(RebuildStatus::AlreadyRunning));
        }
        let _guard = RebuildGuard(&self.rebuilding);

        if self.index.count().await? > 0 {
            debug!("vector index is not empty, skipping rebuild");
            return Ok(RebuildReport::with_status(RebuildStatus::NotEmpty));
        }

        let documents = self.records.query_documents(&DocumentFilter {
            processed: Some(true),
            blacklisted: Some(false),
            ..DocumentFilter::default()
        })?;
        info!(documents = documents.len(), "rebuilding vector index from stored pages");

        let mut report = RebuildReport::with_status(RebuildStatus::Completed);
        for document in documents {
            if !document.pages_are_current() {
                info!(
                    document_id = document.id,
                    filename = %document.filename,
                    "file changed since it was processed, leaving it for reprocessing"
                );
                report.skipped_documents += 1;
                continue;
            }

            match self.rebuild_document(document.id, &document.filename).await {
                Ok(0) => report.skipped_documents += 1,
                Ok(chunks) => {
                    report.documents += 1;
                    report.chunks += chunks;
                }
                Err(error) => {
                    error!(document_id = document.id, %error, "failed to rebuild document vectors");
                    report.failed_documents += 1;
                }
            }
        }

        info!(
            documents = report.documents,
            chunks = report.chunks,
            skipped = report.skipped_documents,
            failed = report.failed_documents,
            "vector rebuild finished"
        );
        Ok(report)
    }

    async fn rebuild_document(&self, document_id: i64, source: &str) -> Result<usize, IngestError> {
        let pages = self.records.pages(document_id)?;
        if pages.is_empty() {
            return Ok(0);
        }

        let text = DocumentText::from_markdown(&pages)?;
        let prepared = prepare_chunks(
            document_id,
            source,
            &text,
            self.chunking,
            Some(REBUILD_BATCH_PREFIX),
        );
        if prepared.is_empty() {
            return Ok(0);
        }

        let vectors = embed_on_blocking_pool(&self.embedder, prepared.texts.clone()).await?;
        let added = self
            .add(&prepared.texts, &vectors, &prepared.metadatas)
            .await?;
        Ok(added.inserted)
    }

    /// Starts a background rebuild unless one is already running. Returns whether a task
    /// was spawned.
    pub fn ensure_async_rebuild(self: &Arc<Self>) -> bool {
        if self.is_rebuilding() {
            return false;
        }

        let store = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = store.rebuild().await {
                error!(%error, "background vector rebuild failed");
            }
        });
        true
    }
}

/// Opens the configured backend (recovering corrupted storage) and schedules a rebuild when
/// the index had to be recovered or starts out empty.
pub async fn open_vector_store(
    config: &IngestConfig,
    records: Arc<dyn RecordStore>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
) -> Result<(Arc<VectorStore>, Recovery), IngestError> {
    let (index, recovery) = open_index(config.vector_backend, &config.vector_dir)?;
    let store = Arc::new(VectorStore::new(index, records, embedder, chunking));

    if recovery.recovered() {
        warn!(?recovery, "vector index was recovered, scheduling rebuild");
        store.ensure_async_rebuild();
    } else if store.count().await? == 0 {
        info!("vector index is empty, scheduling rebuild");
        store.ensure_async_rebuild();
    }

    Ok((store, recovery))
}
