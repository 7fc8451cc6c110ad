//! Durable document records and per-page text.
//!
//! `PageText` rows are the source of truth the vector index is rebuilt from, so they live
//! here rather than next to the vectors.

use crate::error::StoreError;
use crate::models::{Document, DocumentFilter, DocumentId, NewDocument, PageText};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub trait RecordStore: Send + Sync {
    fn create_document(&self, document: &NewDocument) -> Result<Document, StoreError>;

    fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    fn find_by_path(&self, file_path: &str) -> Result<Option<Document>, StoreError>;

    fn find_by_filename(&self, filename: &str) -> Result<Option<Document>, StoreError>;

    /// Writes every mutable column of `document`, keyed by its id.
    fn update_document(&self, document: &Document) -> Result<(), StoreError>;

    /// Progress-only write used while a document is being processed.
    fn update_progress(&self, id: DocumentId, progress: f64) -> Result<(), StoreError>;

    fn query_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError>;

    fn delete_document(&self, id: DocumentId) -> Result<bool, StoreError>;

    fn delete_pages(&self, id: DocumentId) -> Result<usize, StoreError>;

    fn insert_pages(&self, pages: &[PageText]) -> Result<usize, StoreError>;

    fn pages(&self, id: DocumentId) -> Result<Vec<PageText>, StoreError>;
}

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS pdf_documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    file_modified_at TEXT,
    uploaded_at TEXT NOT NULL,
    processed_at TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    processing INTEGER NOT NULL DEFAULT 0,
    page_count INTEGER NOT NULL DEFAULT 0,
    chunks_count INTEGER NOT NULL DEFAULT 0,
    progress REAL NOT NULL DEFAULT 0,
    error TEXT,
    blacklisted INTEGER NOT NULL DEFAULT 0,
    blacklisted_at TEXT,
    blacklist_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_pdf_documents_path ON pdf_documents(file_path);

CREATE TABLE IF NOT EXISTS pdf_markdown_pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pdf_id INTEGER NOT NULL,
    page INTEGER NOT NULL,
    markdown TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pdf_markdown_pages_pdf ON pdf_markdown_pages(pdf_id, page);
"#;

const DOCUMENT_COLUMNS: &str = "id, filename, file_path, file_size, file_modified_at, uploaded_at, \
     processed_at, page_count, chunks_count, progress, processing, processed, error, \
     blacklisted, blacklist_reason, blacklisted_at";

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock still guards a usable connection; SQLite keeps its own consistency.
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find_one(&self, column: &str, value: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn();
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM pdf_documents WHERE {column} = ?1 LIMIT 1");
        let row = conn
            .query_row(&sql, params![value], read_document_row)
            .optional()?;
        row.map(RawDocument::into_document).transpose()
    }
}

impl RecordStore for SqliteRecordStore {
    fn create_document(&self, document: &NewDocument) -> Result<Document, StoreError> {
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO pdf_documents (filename, file_path, file_size, file_modified_at, \
                 uploaded_at, processing, processed, progress) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
                params![
                    document.filename,
                    document.file_path,
                    document.file_size as i64,
                    document.file_modified_at.map(|at| at.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                    document.processing,
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.get_document(id)?
            .ok_or(StoreError::DocumentNotFound(id))
    }

    fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let conn = self.conn();
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM pdf_documents WHERE id = ?1");
        let row = conn.query_row(&sql, params![id], read_document_row).optional()?;
        row.map(RawDocument::into_document).transpose()
    }

    fn find_by_path(&self, file_path: &str) -> Result<Option<Document>, StoreError> {
        self.find_one("file_path", file_path)
    }

    fn find_by_filename(&self, filename: &str) -> Result<Option<Document>, StoreError> {
        self.find_one("filename", filename)
    }

    fn update_document(&self, document: &Document) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE pdf_documents SET filename = ?2, file_path = ?3, file_size = ?4, \
             file_modified_at = ?5, uploaded_at = ?6, processed_at = ?7, page_count = ?8, \
             chunks_count = ?9, progress = ?10, processing = ?11, processed = ?12, error = ?13, \
             blacklisted = ?14, blacklist_reason = ?15, blacklisted_at = ?16 WHERE id = ?1",
            params![
                document.id,
                document.filename,
                document.file_path,
                document.file_size as i64,
                document.file_modified_at.map(|at| at.to_rfc3339()),
                document.uploaded_at.to_rfc3339(),
                document.processed_at.map(|at| at.to_rfc3339()),
                document.page_count,
                document.chunk_count,
                document.progress,
                document.processing,
                document.processed,
                document.error,
                document.blacklisted,
                document.blacklist_reason,
                document.blacklisted_at.map(|at| at.to_rfc3339()),
            ],
        )?;

        if updated == 0 {
            return Err(StoreError::DocumentNotFound(document.id));
        }
        Ok(())
    }

    fn update_progress(&self, id: DocumentId, progress: f64) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE pdf_documents SET progress = ?2 WHERE id = ?1",
            params![id, progress],
        )?;
        if updated == 0 {
            return Err(StoreError::DocumentNotFound(id));
        }
        Ok(())
    }

    fn query_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        let flags = [
            ("processing", filter.processing),
            ("processed", filter.processed),
            ("blacklisted", filter.blacklisted),
        ];
        for (column, flag) in flags {
            if let Some(flag) = flag {
                values.push(Value::Integer(i64::from(flag)));
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }
        if let Some(path) = &filter.file_path {
            values.push(Value::Text(path.clone()));
            clauses.push(format!("file_path = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {DOCUMENT_COLUMNS} FROM pdf_documents");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), read_document_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawDocument::into_document).collect()
    }

    fn delete_document(&self, id: DocumentId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM pdf_documents WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn delete_pages(&self, id: DocumentId) -> Result<usize, StoreError> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM pdf_markdown_pages WHERE pdf_id = ?1", params![id])?;
        Ok(deleted)
    }

    fn insert_pages(&self, pages: &[PageText]) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT INTO pdf_markdown_pages (pdf_id, page, markdown) VALUES (?1, ?2, ?3)")?;
            for page in pages.iter().filter(|page| !page.markdown.is_empty()) {
                stmt.execute(params![page.document_id, page.page, page.markdown])?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn pages(&self, id: DocumentId) -> Result<Vec<PageText>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT pdf_id, page, markdown FROM pdf_markdown_pages WHERE pdf_id = ?1 ORDER BY page, id",
        )?;
        let pages = stmt
            .query_map(params![id], |row| {
                Ok(PageText {
                    document_id: row.get(0)?,
                    page: row.get(1)?,
                    markdown: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }
}

struct RawDocument {
    id: DocumentId,
    filename: String,
    file_path: String,
    file_size: i64,
    file_modified_at: Option<String>,
    uploaded_at: String,
    processed_at: Option<String>,
    page_count: u32,
    chunk_count: u32,
    progress: f64,
    processing: bool,
    processed: bool,
    error: Option<String>,
    blacklisted: bool,
    blacklist_reason: Option<String>,
    blacklisted_at: Option<String>,
}

fn read_document_row(row: &Row<'_>) -> rusqlite::Result<RawDocument> {
    Ok(RawDocument {
        id: row.get(0)?,
        filename: row.get(1)?,
        file_path: row.get(2)?,
        file_size: row.get(3)?,
        file_modified_at: row.get(4)?,
        uploaded_at: row.get(5)?,
        processed_at: row.get(6)?,
        page_count: row.get(7)?,
        chunk_count: row.get(8)?,
        progress: row.get(9)?,
        processing: row.get(10)?,
        processed: row.get(11)?,
        error: row.get(12)?,
        blacklisted: row.get(13)?,
        blacklist_reason: row.get(14)?,
        blacklisted_at: row.get(15)?,
    })
}

impl RawDocument {
    fn into_document(self) -> Result<Document, StoreError> {
        Ok(Document {
            id: self.id,
            filename: self.filename,
            file_path: self.file_path,
            file_size: self.file_size.max(0) as u64,
            file_modified_at: parse_optional("file_modified_at", self.file_modified_at)?,
            uploaded_at: parse_timestamp("uploaded_at", &self.uploaded_at)?,
            processed_at: parse_optional("processed_at", self.processed_at)?,
            page_count: self.page_count,
            chunk_count: self.chunk_count,
            progress: self.progress,
            processing: self.processing,
            processed: self.processed,
            error: self.error,
            blacklisted: self.blacklisted,
            blacklist_reason: self.blacklist_reason,
            blacklisted_at: parse_optional("blacklisted_at", self.blacklisted_at)?,
        })
    }
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| StoreError::InvalidValue {
            column: column.to_string(),
            details: error.to_string(),
        })
}

fn parse_optional(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|value| parse_timestamp(column, &value))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_document(name: &str) -> NewDocument {
        NewDocument {
            filename: name.to_string(),
            file_path: format!("/data/{name}"),
            file_size: 42,
            file_modified_at: Some(Utc::now()),
            processing: true,
        }
    }

    #[test]
    fn unusable_database_directory_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("data");
        std::fs::write(&blocker, b"not a directory")?;

        assert!(matches!(
            SqliteRecordStore::open(&blocker.join("nested").join("records.db")),
            Err(StoreError::Io(_))
        ));
        Ok(())
    }

    #[test]
    fn documents_round_trip_through_update() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRecordStore::open_in_memory()?;
        let mut document = store.create_document(&new_document("manual.pdf"))?;
        assert!(document.processing);
        assert!(!document.processed);

        document.processing = false;
        document.processed = true;
        document.chunk_count = 12;
        document.processed_at = Some(Utc::now());
        store.update_document(&document)?;

        let loaded = store.get_document(document.id)?.expect("document exists");
        assert!(loaded.processed);
        assert_eq!(loaded.chunk_count, 12);
        assert_eq!(
            store.find_by_path("/data/manual.pdf")?.map(|doc| doc.id),
            Some(document.id)
        );
        Ok(())
    }

    #[test]
    fn filters_select_by_flags() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRecordStore::open_in_memory()?;
        let running = store.create_document(&new_document("a.pdf"))?;
        let mut done = store.create_document(&new_document("b.pdf"))?;
        done.processing = false;
        done.processed = true;
        store.update_document(&done)?;

        let processing = store.query_documents(&DocumentFilter::processing())?;
        assert_eq!(processing.iter().map(|doc| doc.id).collect::<Vec<_>>(), vec![running.id]);

        let processed = store.query_documents(&DocumentFilter::processed())?;
        assert_eq!(processed.iter().map(|doc| doc.id).collect::<Vec<_>>(), vec![done.id]);

        assert_eq!(store.query_documents(&DocumentFilter::default())?.len(), 2);
        Ok(())
    }

    #[test]
    fn pages_are_replaced_not_appended() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRecordStore::open_in_memory()?;
        let document = store.create_document(&new_document("a.pdf"))?;
        let page = |page: u32, text: &str| PageText {
            document_id: document.id,
            page,
            markdown: text.to_string(),
        };

        store.insert_pages(&[page(1, "one"), page(2, "two")])?;
        store.delete_pages(document.id)?;
        store.insert_pages(&[page(1, "uno")])?;

        let pages = store.pages(document.id)?;
        assert_eq!(pages, vec![page(1, "uno")]);
        Ok(())
    }

    #[test]
    fn updating_a_missing_document_fails() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteRecordStore::open_in_memory()?;
        let mut document = store.create_document(&new_document("a.pdf"))?;
        assert!(store.delete_document(document.id)?);

        document.progress = 10.0;
        assert!(matches!(
            store.update_document(&document),
            Err(StoreError::DocumentNotFound(_))
        ));
        Ok(())
    }
}
