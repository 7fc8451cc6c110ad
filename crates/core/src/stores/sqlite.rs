use crate::error::IndexError;
use crate::models::{RecordFilter, RecordMetadata, RecordSelector, SearchHit, VectorRecord};
use crate::stores::recovery::RecoverableIndex;
use crate::traits::{cosine_similarity, rank_hits, VectorIndex};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex};

const BACKEND: &str = "sqlite";
pub const DATABASE_FILE: &str = "vectors.sqlite3";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS vector_records (
    id TEXT PRIMARY KEY,
    document_id INTEGER NOT NULL,
    source TEXT NOT NULL,
    page INTEGER NOT NULL,
    batch TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    length INTEGER NOT NULL,
    timestamp REAL NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vector_records_document ON vector_records(document_id);
"#;

/// Vectors in a SQLite table, scored by brute-force cosine similarity.
pub struct SqliteVectorIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorIndex {
    pub fn open(directory: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(directory)?;
        let conn = Connection::open(directory.join(DATABASE_FILE)).map_err(classify)?;

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(classify)?;
        if check != "ok" {
            return Err(IndexError::Corrupted {
                backend: BACKEND.to_string(),
                details: check,
            });
        }

        conn.execute_batch(CREATE_TABLE).map_err(classify)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, operation: F) -> Result<T, IndexError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, IndexError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            operation(&mut conn)
        })
        .await?
    }
}

impl RecoverableIndex for SqliteVectorIndex {
    fn open_at(directory: &Path) -> Result<Self, IndexError> {
        Self::open(directory)
    }

    fn drop_collection(directory: &Path) -> Result<(), IndexError> {
        let conn = Connection::open(directory.join(DATABASE_FILE)).map_err(classify)?;
        conn.execute_batch("DROP TABLE IF EXISTS vector_records;")
            .map_err(classify)?;
        Ok(())
    }
}

/// Damaged database files surface as `Corrupted` so the recovery ladder can act on them.
fn classify(error: rusqlite::Error) -> IndexError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => IndexError::Corrupted {
            backend: BACKEND.to_string(),
            details: error.to_string(),
        },
        _ => IndexError::Sqlite(error),
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn filter_clause(filter: Option<&RecordFilter>) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(filter) = filter {
        if let Some(document_id) = filter.document_id {
            values.push(Value::Integer(document_id));
            clauses.push(format!("document_id = ?{}", values.len()));
        }
        if let Some(source) = &filter.source {
            values.push(Value::Text(source.clone()));
            clauses.push(format!("source = ?{}", values.len()));
        }
        if let Some(page) = filter.page {
            values.push(Value::Integer(i64::from(page)));
            clauses.push(format!("page = ?{}", values.len()));
        }
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn insert(&self, records: &[VectorRecord]) -> Result<usize, IndexError> {
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(classify)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR REPLACE INTO vector_records (id, document_id, source, page, batch, \
                         chunk_index, length, timestamp, text, embedding) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    )
                    .map_err(classify)?;
                for record in &records {
                    let metadata = &record.metadata;
                    stmt.execute(params![
                        record.id,
                        metadata.document_id,
                        metadata.source,
                        metadata.page,
                        metadata.batch,
                        metadata.index,
                        metadata.length,
                        metadata.timestamp,
                        record.text,
                        encode_vector(&record.vector),
                    ])
                    .map_err(classify)?;
                }
            }
            tx.commit().map_err(classify)?;
            Ok(records.len())
        })
        .await
    }

    async fn delete(&self, selector: &RecordSelector) -> Result<usize, IndexError> {
        let selector = selector.clone();
        self.with_conn(move |conn| match selector {
            RecordSelector::Ids(ids) => {
                let tx = conn.transaction().map_err(classify)?;
                let mut deleted = 0;
                {
                    let mut stmt = tx
                        .prepare("DELETE FROM vector_records WHERE id = ?1")
                        .map_err(classify)?;
                    for id in &ids {
                        deleted += stmt.execute(params![id]).map_err(classify)?;
                    }
                }
                tx.commit().map_err(classify)?;
                Ok(deleted)
            }
            RecordSelector::Filter(filter) => {
                let (clause, values) = filter_clause(Some(&filter));
                conn.execute(
                    &format!("DELETE FROM vector_records{clause}"),
                    params_from_iter(values),
                )
                .map_err(classify)
            }
        })
        .await
    }

    async fn search(
        &self,
        query: &[f32],
        fetch: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let query = query.to_vec();
        let (clause, values) = filter_clause(filter);

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT id, document_id, source, page, batch, chunk_index, length, timestamp, \
                     text, embedding FROM vector_records{clause}"
                ))
                .map_err(classify)?;

            let hits = stmt
                .query_map(params_from_iter(values), |row| {
                    let embedding: Vec<u8> = row.get(9)?;
                    Ok(SearchHit {
                        id: row.get(0)?,
                        metadata: RecordMetadata {
                            document_id: row.get(1)?,
                            source: row.get(2)?,
                            page: row.get(3)?,
                            batch: row.get(4)?,
                            index: row.get(5)?,
                            length: row.get(6)?,
                            timestamp: row.get(7)?,
                        },
                        text: row.get(8)?,
                        score: cosine_similarity(&query, &decode_vector(&embedding)),
                    })
                })
                .map_err(classify)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(classify)?;

            Ok(rank_hits(hits, fetch))
        })
        .await
    }

    async fn count(&self) -> Result<usize, IndexError> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM vector_records", [], |row| row.get(0))
                .map_err(classify)?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn reset(&self) -> Result<(), IndexError> {
        self.with_conn(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS vector_records;")
                .map_err(classify)?;
            conn.execute_batch(CREATE_TABLE).map_err(classify)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(document_id: i64, index: u32, vector: Vec<f32>) -> VectorRecord {
        let metadata = RecordMetadata {
            document_id,
            source: format!("doc-{document_id}.pdf"),
            page: 1,
            batch: "0a1b2c3d".to_string(),
            index,
            length: 4,
            timestamp: 0.0,
        };
        VectorRecord {
            id: metadata.record_id(),
            text: format!("chunk {index}"),
            vector,
            metadata,
        }
    }

    #[tokio::test]
    async fn insert_replaces_records_with_the_same_id() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let index = SqliteVectorIndex::open(dir.path())?;

        index.insert(&[record(1, 0, vec![1.0, 0.0])]).await?;
        index.insert(&[record(1, 0, vec![0.0, 1.0])]).await?;
        assert_eq!(index.count().await?, 1);

        let hits = index.search(&[0.0, 1.0], 5, None).await?;
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[tokio::test]
    async fn filter_limits_search_and_delete() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let index = SqliteVectorIndex::open(dir.path())?;
        index
            .insert(&[
                record(1, 0, vec![1.0, 0.0]),
                record(1, 1, vec![0.8, 0.2]),
                record(2, 0, vec![1.0, 0.1]),
            ])
            .await?;

        let only_second = RecordFilter::document(2);
        let hits = index.search(&[1.0, 0.0], 10, Some(&only_second)).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.document_id, 2);

        let deleted = index
            .delete(&RecordSelector::Filter(RecordFilter::document(1)))
            .await?;
        assert_eq!(deleted, 2);
        assert_eq!(index.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn records_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        {
            let index = SqliteVectorIndex::open(dir.path())?;
            index.insert(&[record(3, 0, vec![0.5, 0.5])]).await?;
        }

        let reopened = SqliteVectorIndex::open(dir.path())?;
        assert_eq!(reopened.count().await?, 1);
        reopened.reset().await?;
        assert_eq!(reopened.count().await?, 0);
        Ok(())
    }

    #[test]
    fn garbage_file_is_reported_as_corruption() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(DATABASE_FILE), vec![0x42u8; 8192])?;

        assert!(matches!(
            SqliteVectorIndex::open(dir.path()),
            Err(IndexError::Corrupted { .. })
        ));
        Ok(())
    }
}
