//! Operator-facing document management: startup reconciliation, uploads, removal and the
//! blacklist.

use crate::error::{IngestError, StoreError};
use crate::ingest::is_pdf_path;
use crate::models::{
    Document, DocumentFilter, DocumentId, FileStat, NewDocument, RecordFilter, RecordSelector,
};
use crate::records::RecordStore;
use crate::status::StatusBoard;
use crate::vector_store::VectorStore;
use chrono::Utc;
use std::path::Path;
use tracing::{info, warn};

pub const INTERRUPTED_ERROR: &str = "Processing was interrupted";

/// Clears `processing` on records left over from a previous run. Returns how many were reset.
pub fn reset_interrupted_processing(
    records: &dyn RecordStore,
    statuses: &StatusBoard,
) -> Result<usize, StoreError> {
    let interrupted = records.query_documents(&DocumentFilter::processing())?;
    if interrupted.is_empty() {
        return Ok(0);
    }

    info!(count = interrupted.len(), "found documents with interrupted processing");
    for mut document in interrupted.iter().cloned() {
        document.processing = false;
        if document.error.is_none() {
            document.error = Some(INTERRUPTED_ERROR.to_string());
        }
        records.update_document(&document)?;
        statuses.remove(document.id);
        info!(document_id = document.id, filename = %document.filename, "reset interrupted processing");
    }

    Ok(interrupted.len())
}

/// Registers a PDF for ingestion and marks it processing. A file that is already known by
/// path is reused unless it is blacklisted. The pipeline drops the previous version's
/// vector records when it runs.
pub fn register_upload(records: &dyn RecordStore, path: &Path) -> Result<Document, IngestError> {
    if !is_pdf_path(path) {
        return Err(IngestError::InvalidArgument(format!(
            "only PDF files are allowed: {}",
            path.display()
        )));
    }
    let stat = FileStat::read(path)
        .map_err(|_| IngestError::MissingFile(path.display().to_string()))?;
    let file_path = path.display().to_string();

    if let Some(mut document) = records.find_by_path(&file_path)? {
        if document.processing {
            return Err(IngestError::InvalidArgument(format!(
                "{} is already being processed",
                document.filename
            )));
        }
        if document.blacklisted {
            return Err(IngestError::InvalidArgument(format!(
                "{} is blacklisted",
                document.filename
            )));
        }
        document.processing = true;
        document.processed = false;
        document.error = None;
        document.progress = 0.0;
        document.file_size = stat.size;
        document.file_modified_at = stat.modified_at;
        records.update_document(&document)?;
        return Ok(document);
    }

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| IngestError::InvalidArgument(format!("path has no file name: {}", file_path)))?;
    if records.find_by_filename(&filename)?.is_some() {
        return Err(IngestError::InvalidArgument(format!(
            "a document named {filename} already exists"
        )));
    }

    Ok(records.create_document(&NewDocument {
        filename,
        file_path,
        file_size: stat.size,
        file_modified_at: stat.modified_at,
        processing: true,
    })?)
}

/// Deletes a document's vectors, stored pages and record, and the file itself when
/// `delete_file` is set. Documents with live progress are refused.
pub async fn remove_document(
    records: &dyn RecordStore,
    vectors: &VectorStore,
    statuses: &StatusBoard,
    document_id: DocumentId,
    delete_file: bool,
) -> Result<Document, IngestError> {
    let document = records
        .get_document(document_id)?
        .ok_or(StoreError::DocumentNotFound(document_id))?;

    let running = statuses
        .get(document_id)
        .is_some_and(|status| !status.stage.is_terminal() && status.progress < 100.0);
    if document.processing && running {
        return Err(IngestError::InvalidArgument(format!(
            "cannot delete {} while it is being processed",
            document.filename
        )));
    }
    statuses.remove(document_id);

    if delete_file && !document.file_path.is_empty() {
        let path = Path::new(&document.file_path);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }

    let deleted = vectors
        .delete(&RecordSelector::Filter(RecordFilter::document(document_id)))
        .await?;
    let pages = records.delete_pages(document_id)?;
    records.delete_document(document_id)?;

    info!(document_id, filename = %document.filename, vectors = deleted, pages, "document removed");
    Ok(document)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlacklistTarget {
    Id(DocumentId),
    /// Unknown names get a placeholder record so a future file with that name is skipped.
    Filename(String),
}

pub fn blacklist_document(
    records: &dyn RecordStore,
    target: &BlacklistTarget,
    reason: Option<String>,
) -> Result<Document, StoreError> {
    let mut document = match target {
        BlacklistTarget::Id(id) => records
            .get_document(*id)?
            .ok_or(StoreError::DocumentNotFound(*id))?,
        BlacklistTarget::Filename(name) => match records.find_by_filename(name)? {
            Some(document) => document,
            None => records.create_document(&NewDocument {
                filename: name.clone(),
                file_path: String::new(),
                file_size: 0,
                file_modified_at: None,
                processing: false,
            })?,
        },
    };

    document.blacklisted = true;
    document.blacklisted_at = Some(Utc::now());
    document.blacklist_reason = reason;
    document.processing = false;
    document.processed = false;
    records.update_document(&document)?;

    warn!(document_id = document.id, filename = %document.filename, "document blacklisted");
    Ok(document)
}

/// Clears the blacklist flag. A watched file becomes eligible again on the next scan.
pub fn unblacklist_document(
    records: &dyn RecordStore,
    document_id: DocumentId,
) -> Result<Document, StoreError> {
    let mut document = records
        .get_document(document_id)?
        .ok_or(StoreError::DocumentNotFound(document_id))?;

    document.blacklisted = false;
    document.blacklisted_at = None;
    document.blacklist_reason = None;
    records.update_document(&document)?;

    info!(document_id, filename = %document.filename, "document removed from blacklist");
    Ok(document)
}

pub fn list_blacklisted(records: &dyn RecordStore) -> Result<Vec<Document>, StoreError> {
    records.query_documents(&DocumentFilter::blacklisted())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::DisabledOcr;
    use crate::pipeline::IngestOutcome;
    use crate::status::{IngestStage, ProcessingStatus};
    use crate::test_support::{TestPdf, TestStack};
    use std::sync::Arc;

    #[test]
    fn interrupted_documents_are_reset() -> Result<(), Box<dyn std::error::Error>> {
        let stack = TestStack::new(Arc::new(DisabledOcr))?;
        let records = stack.records.as_ref();
        let stale = register_upload(records, &{
            let path = stack.dir.path().join("stale.pdf");
            TestPdf::text_pages(&["left behind"]).save(&path)?;
            path
        })?;
        let statuses = stack.pipeline.statuses();
        statuses.set(stale.id, ProcessingStatus::queued("stale.pdf"));

        assert_eq!(reset_interrupted_processing(records, statuses)?, 1);
        let document = records.get_document(stale.id)?.expect("document exists");
        assert!(!document.processing);
        assert_eq!(document.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert!(statuses.get(stale.id).is_none());

        assert_eq!(reset_interrupted_processing(records, statuses)?, 0);
        Ok(())
    }

    #[test]
    fn uploads_must_be_pdfs_with_unique_names() -> Result<(), Box<dyn std::error::Error>> {
        let stack = TestStack::new(Arc::new(DisabledOcr))?;
        let records = stack.records.as_ref();
        let text = stack.dir.path().join("notes.txt");
        std::fs::write(&text, b"plain")?;
        assert!(matches!(
            register_upload(records, &text),
            Err(IngestError::InvalidArgument(_))
        ));

        let first = stack.dir.path().join("manual.pdf");
        TestPdf::text_pages(&["one"]).save(&first)?;
        let document = register_upload(records, &first)?;
        assert!(document.processing);
        assert!(register_upload(records, &first).is_err());

        std::fs::create_dir_all(stack.dir.path().join("other"))?;
        let clash = stack.dir.path().join("other").join("manual.pdf");
        TestPdf::text_pages(&["two"]).save(&clash)?;
        assert!(register_upload(records, &clash).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn blacklisted_upload_stays_blacklisted() -> Result<(), Box<dyn std::error::Error>> {
        let stack = TestStack::new(Arc::new(DisabledOcr))?;
        let path = stack.dir.path().join("spam.pdf");
        TestPdf::text_pages(&["Unwanted advertising"]).save(&path)?;
        let document = register_upload(stack.records.as_ref(), &path)?;
        stack.pipeline.process(document.id, &path, &document.filename).await?;
        blacklist_document(
            stack.records.as_ref(),
            &BlacklistTarget::Id(document.id),
            Some("unwanted".to_string()),
        )?;

        assert!(matches!(
            register_upload(stack.records.as_ref(), &path),
            Err(IngestError::InvalidArgument(_))
        ));
        assert!(matches!(
            stack.pipeline.process(document.id, &path, &document.filename).await,
            Err(IngestError::InvalidArgument(_))
        ));

        let stored = stack.records.get_document(document.id)?.expect("document exists");
        assert!(stored.blacklisted);
        assert!(!stored.processed);
        assert!(!stored.processing);

        unblacklist_document(stack.records.as_ref(), document.id)?;
        let readmitted = register_upload(stack.records.as_ref(), &path)?;
        assert!(readmitted.processing);
        Ok(())
    }

    #[tokio::test]
    async fn changed_upload_replaces_previous_vectors() -> Result<(), Box<dyn std::error::Error>> {
        let stack = TestStack::new(Arc::new(DisabledOcr))?;
        let path = stack.dir.path().join("manual.pdf");
        TestPdf::text_pages(&["Hydraulic pumps version one"]).save(&path)?;
        let document = register_upload(stack.records.as_ref(), &path)?;
        stack.pipeline.process(document.id, &path, &document.filename).await?;
        let first = stack.pipeline.vectors().count().await?;

        TestPdf::text_pages(&["Bearing lubrication schedule"]).save(&path)?;
        let again = register_upload(stack.records.as_ref(), &path)?;
        assert_eq!(again.id, document.id);
        let report = stack.pipeline.process(again.id, &path, &again.filename).await?;
        let IngestOutcome::Completed { chunks } = report.outcome else {
            panic!("expected completion");
        };

        assert_eq!(stack.pipeline.vectors().count().await?, chunks);
        assert_eq!(first, chunks);
        let hits = stack
            .pipeline
            .vectors()
            .search_text("pumps", 10, Some(&RecordFilter::document(document.id)), 0)
            .await?
            .hits;
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.text.contains("Bearing")));
        Ok(())
    }

    #[tokio::test]
    async fn removal_purges_vectors_pages_and_file()-> Result<(), Box<dyn std::error::Error>> {
        let stack = TestStack::new(Arc::new(DisabledOcr))?;
        let path = stack.dir.path().join("manual.pdf");
        TestPdf::text_pages(&["Hydraulic pumps", "Valves"]).save(&path)?;
        let document = register_upload(stack.records.as_ref(), &path)?;
        stack.pipeline.process(document.id, &path, &document.filename).await?;
        assert!(stack.pipeline.vectors().count().await? > 0);

        remove_document(
            stack.records.as_ref(),
            stack.pipeline.vectors(),
            stack.pipeline.statuses(),
            document.id,
            true,
        )
        .await?;

        assert_eq!(stack.pipeline.vectors().count().await?, 0);
        assert!(stack.records.pages(document.id)?.is_empty());
        assert!(stack.records.get_document(document.id)?.is_none());
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn removal_is_refused_while_processing() -> Result<(), Box<dyn std::error::Error>> {
        let stack = TestStack::new(Arc::new(DisabledOcr))?;
        let path = stack.dir.path().join("busy.pdf");
        TestPdf::text_pages(&["busy"]).save(&path)?;
        let document = register_upload(stack.records.as_ref(), &path)?;
        let mut status = ProcessingStatus::queued("busy.pdf");
        status.advance(IngestStage::Parsing, "Parsing PDF (1/2)", 25.0);
        stack.pipeline.statuses().set(document.id, status);

        let result = remove_document(
            stack.records.as_ref(),
            stack.pipeline.vectors(),
            stack.pipeline.statuses(),
            document.id,
            false,
        )
        .await;
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        assert!(stack.records.get_document(document.id)?.is_some());
        Ok(())
    }

    #[test]
    fn blacklist_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let stack = TestStack::new(Arc::new(DisabledOcr))?;
        let records = stack.records.as_ref();

        let placeholder = blacklist_document(
            records,
            &BlacklistTarget::Filename("spam.pdf".to_string()),
            Some("unwanted".to_string()),
        )?;
        assert!(placeholder.blacklisted);
        assert!(placeholder.file_path.is_empty());

        let again = blacklist_document(
            records,
            &BlacklistTarget::Id(placeholder.id),
            Some("still unwanted".to_string()),
        )?;
        assert_eq!(again.id, placeholder.id);

        let listed = list_blacklisted(records)?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].blacklist_reason.as_deref(), Some("still unwanted"));

        let cleared = unblacklist_document(records, placeholder.id)?;
        assert!(!cleared.blacklisted);
        assert!(cleared.blacklisted_at.is_none());
        assert!(list_blacklisted(records)?.is_empty());

        assert!(matches!(
            blacklist_document(records, &BlacklistTarget::Id(404), None),
            Err(StoreError::DocumentNotFound(404))
        ));
        Ok(())
    }
}
