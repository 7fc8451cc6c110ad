use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub type DocumentId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub filename: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_modified_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub page_count: u32,
    pub chunk_count: u32,
    pub progress: f64,
    pub processing: bool,
    pub processed: bool,
    pub error: Option<String>,
    pub blacklisted: bool,
    pub blacklist_reason: Option<String>,
    pub blacklisted_at: Option<DateTime<Utc>>,
}

impl Document {
    /// True when the file on disk no longer matches what was recorded at scheduling time.
    pub fn file_changed(&self, stat: &FileStat) -> bool {
        if self.file_size != stat.size {
            return true;
        }

        match (self.file_modified_at, stat.modified_at) {
            (Some(recorded), Some(current)) => current > recorded,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Persisted page text is only trusted while the source file is older than the last
    /// successful run. A file that disappeared does not invalidate the stored text.
    pub fn pages_are_current(&self) -> bool {
        if self.file_path.is_empty() {
            return true;
        }

        let Ok(stat) = FileStat::read(Path::new(&self.file_path)) else {
            return true;
        };

        match (stat.modified_at, self.processed_at) {
            (Some(modified), Some(processed)) => modified <= processed,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_modified_at: Option<DateTime<Utc>>,
    pub processing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub processing: Option<bool>,
    pub processed: Option<bool>,
    pub blacklisted: Option<bool>,
    pub file_path: Option<String>,
}

impl DocumentFilter {
    pub fn processing() -> Self {
        Self {
            processing: Some(true),
            ..Self::default()
        }
    }

    pub fn processed() -> Self {
        Self {
            processed: Some(true),
            ..Self::default()
        }
    }

    pub fn blacklisted() -> Self {
        Self {
            blacklisted: Some(true),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileStat {
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageText {
    pub document_id: DocumentId,
    pub page: u32,
    pub markdown: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMetadata {
    pub document_id: DocumentId,
    pub source: String,
    pub page: u32,
    pub batch: String,
    pub index: u32,
    pub length: u32,
    pub timestamp: f64,
}

impl RecordMetadata {
    pub fn record_id(&self) -> String {
        format!("doc_{}_{}_{}", self.document_id, self.batch, self.index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub document_id: Option<DocumentId>,
    pub source: Option<String>,
    pub page: Option<u32>,
}

impl RecordFilter {
    pub fn document(document_id: DocumentId) -> Self {
        Self {
            document_id: Some(document_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.source.is_none() && self.page.is_none()
    }

    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        self.document_id
            .map_or(true, |document_id| metadata.document_id == document_id)
            && self
                .source
                .as_ref()
                .map_or(true, |source| &metadata.source == source)
            && self.page.map_or(true, |page| metadata.page == page)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordSelector {
    Ids(Vec<String>),
    Filter(RecordFilter),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: RecordMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub has_more: bool,
    pub offset: usize,
    pub limit: usize,
    pub total_fetched: usize,
}

impl SearchPage {
    pub fn empty(offset: usize, limit: usize) -> Self {
        Self {
            hits: Vec::new(),
            has_more: false,
            offset,
            limit,
            total_fetched: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn document(size: u64, modified: Option<DateTime<Utc>>) -> Document {
        Document {
            id: 1,
            filename: "a.pdf".to_string(),
            file_path: String::new(),
            file_size: size,
            file_modified_at: modified,
            uploaded_at: Utc::now(),
            processed_at: None,
            page_count: 0,
            chunk_count: 0,
            progress: 0.0,
            processing: false,
            processed: true,
            error: None,
            blacklisted: false,
            blacklist_reason: None,
            blacklisted_at: None,
        }
    }

    #[test]
    fn size_or_newer_mtime_counts_as_change() {
        let now = Utc::now();
        let doc = document(10, Some(now));

        assert!(!doc.file_changed(&FileStat {
            size: 10,
            modified_at: Some(now)
        }));
        assert!(doc.file_changed(&FileStat {
            size: 11,
            modified_at: Some(now)
        }));
        assert!(doc.file_changed(&FileStat {
            size: 10,
            modified_at: Some(now + Duration::seconds(3))
        }));
    }

    #[test]
    fn record_filter_matches_all_set_fields() {
        let metadata = RecordMetadata {
            document_id: 4,
            source: "manual.pdf".to_string(),
            page: 2,
            batch: "abcd1234".to_string(),
            index: 0,
            length: 10,
            timestamp: 0.0,
        };

        assert!(RecordFilter::default().matches(&metadata));
        assert!(RecordFilter::document(4).matches(&metadata));
        assert!(!RecordFilter::document(5).matches(&metadata));
        assert_eq!(metadata.record_id(), "doc_4_abcd1234_0");
    }
}
