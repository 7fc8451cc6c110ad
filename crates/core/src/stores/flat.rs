use crate::error::IndexError;
use crate::models::{RecordFilter, RecordSelector, SearchHit, VectorRecord};
use crate::stores::recovery::RecoverableIndex;
use crate::traits::{cosine_similarity, rank_hits, VectorIndex};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const BACKEND: &str = "flat";
const FORMAT_VERSION: u32 = 1;
const COMPACT_AFTER: usize = 1000;
pub const COLLECTION_FILE: &str = "collection.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOG_FILE: &str = "changes.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Manifest {
    format_version: u32,
    backend: String,
    record_count: usize,
}

/// One line of the change log. A line is written per batch, so a batch is applied whole or
/// not at all on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Upsert { records: Vec<VectorRecord> },
    Delete { ids: Vec<String> },
}

struct FlatState {
    records: BTreeMap<String, VectorRecord>,
    log_entries: usize,
}

impl FlatState {
    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Upsert { records } => {
                for record in records {
                    self.records.insert(record.id.clone(), record);
                }
            }
            LogEntry::Delete { ids } => {
                for id in ids {
                    self.records.remove(&id);
                }
            }
        }
    }
}

/// Records held in memory. Mutations are appended to a JSON-lines change log before they
/// touch memory; the log is folded into `collection.json` every [`COMPACT_AFTER`] entries.
pub struct FlatVectorIndex {
    directory: PathBuf,
    compact_after: usize,
    state: RwLock<FlatState>,
}

impl FlatVectorIndex {
    pub fn open(directory: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(directory)?;

        let manifest = read_json::<Manifest>(&directory.join(MANIFEST_FILE))?;
        if let Some(manifest) = &manifest {
            if manifest.format_version != FORMAT_VERSION || manifest.backend != BACKEND {
                return Err(corrupted(format!(
                    "unsupported manifest {} v{}",
                    manifest.backend, manifest.format_version
                )));
            }
        }

        let records = read_json::<Vec<VectorRecord>>(&directory.join(COLLECTION_FILE))?
            .unwrap_or_default();
        if let Some(manifest) = manifest {
            if manifest.record_count != records.len() {
                return Err(corrupted(format!(
                    "manifest lists {} records, collection has {}",
                    manifest.record_count,
                    records.len()
                )));
            }
        }

        let mut state = FlatState {
            records: records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            log_entries: 0,
        };
        replay_log(&directory.join(LOG_FILE), &mut state)?;

        Ok(Self {
            directory: directory.to_path_buf(),
            compact_after: COMPACT_AFTER,
            state: RwLock::new(state),
        })
    }

    #[cfg(test)]
    fn with_compaction_after(mut self, entries: usize) -> Self {
        self.compact_after = entries.max(1);
        self
    }

    async fn append(&self, state: &mut FlatState, entry: &LogEntry) -> Result<(), IndexError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let path = self.directory.join(LOG_FILE);
        tokio::task::spawn_blocking(move || append_line(&path, &line)).await??;
        state.log_entries += 1;
        Ok(())
    }

    /// Folds the log into a fresh snapshot. The log already holds the data, so a failure
    /// here is only logged.
    async fn compact_if_due(&self, state: &mut FlatState) {
        if state.log_entries < self.compact_after {
            return;
        }
        match self.write_snapshot(&state.records).await {
            Ok(()) => {
                debug!(records = state.records.len(), entries = state.log_entries, "flat index compacted");
                state.log_entries = 0;
            }
            Err(error) => warn!(%error, "flat index compaction failed"),
        }
    }

    async fn write_snapshot(&self, records: &BTreeMap<String, VectorRecord>) -> Result<(), IndexError> {
        let snapshot = records.values().collect::<Vec<_>>();
        write_atomically(
            &self.directory.join(COLLECTION_FILE),
            serde_json::to_vec(&snapshot)?,
        )
        .await?;

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            backend: BACKEND.to_string(),
            record_count: records.len(),
        };
        write_atomically(
            &self.directory.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        // Replaying the log over the new snapshot is idempotent, so a crash before this
        // point loses nothing.
        let log = self.directory.join(LOG_FILE);
        if tokio::fs::try_exists(&log).await? {
            tokio::fs::remove_file(&log).await?;
        }
        Ok(())
    }
}

impl RecoverableIndex for FlatVectorIndex {
    fn open_at(directory: &Path) -> Result<Self, IndexError> {
        Self::open(directory)
    }

    fn drop_collection(directory: &Path) -> Result<(), IndexError> {
        for name in [COLLECTION_FILE, MANIFEST_FILE, LOG_FILE] {
            let path = directory.join(name);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn corrupted(details: String) -> IndexError {
    IndexError::Corrupted {
        backend: BACKEND.to_string(),
        details,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, IndexError> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|error| corrupted(format!("{}: {error}", path.display())))
}

/// Applies every complete log line. An unterminated last line is a write cut short by a
/// crash and is truncated away; any other bad line is corruption.
fn replay_log(path: &Path, state: &mut FlatState) -> Result<(), IndexError> {
    if !path.exists() {
        return Ok(());
    }

    let bytes = std::fs::read(path)?;
    let mut offset = 0usize;
    for line in bytes.split_inclusive(|byte| *byte == b'\n') {
        if !line.ends_with(b"\n") {
            warn!(path = %path.display(), bytes = line.len(), "dropping torn change log entry");
            OpenOptions::new().write(true).open(path)?.set_len(offset as u64)?;
            break;
        }

        let entry = serde_json::from_slice::<LogEntry>(line)
            .map_err(|error| corrupted(format!("{} at byte {offset}: {error}", path.display())))?;
        state.apply(entry);
        state.log_entries += 1;
        offset += line.len();
    }
    Ok(())
}

fn append_line(path: &Path, line: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let committed = file.metadata()?.len();
    let written = file.write_all(line).and_then(|()| file.sync_data());
    if let Err(error) = written {
        if let Err(truncate) = file.set_len(committed) {
            warn!(path = %path.display(), error = %truncate, "failed to drop partial change log entry");
        }
        return Err(error);
    }
    Ok(())
}

async fn write_atomically(path: &Path, bytes: Vec<u8>) -> Result<(), IndexError> {
    let temporary = path.with_extension("json.tmp");
    tokio::fs::write(&temporary, bytes).await?;
    tokio::fs::rename(&temporary, path).await?;
    Ok(())
}

#[async_trait]
impl VectorIndex for FlatVectorIndex {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn insert(&self, records: &[VectorRecord]) -> Result<usize, IndexError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write().await;
        let entry = LogEntry::Upsert {
            records: records.to_vec(),
        };
        self.append(&mut state, &entry).await?;
        state.apply(entry);
        self.compact_if_due(&mut state).await;
        Ok(records.len())
    }

    async fn delete(&self, selector: &RecordSelector) -> Result<usize, IndexError> {
        let mut state = self.state.write().await;
        let ids = match selector {
            RecordSelector::Ids(ids) => {
                let wanted = ids.iter().collect::<HashSet<_>>();
                state
                    .records
                    .keys()
                    .filter(|id| wanted.contains(id))
                    .cloned()
                    .collect::<Vec<_>>()
            }
            RecordSelector::Filter(filter) => state
                .records
                .values()
                .filter(|record| filter.matches(&record.metadata))
                .map(|record| record.id.clone())
                .collect(),
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let deleted = ids.len();
        let entry = LogEntry::Delete { ids };
        self.append(&mut state, &entry).await?;
        state.apply(entry);
        self.compact_if_due(&mut state).await;
        Ok(deleted)
    }

    async fn search(
        &self,
        query: &[f32],
        fetch: usize,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let state = self.state.read().await;
        let hits = state
            .records
            .values()
            .filter(|record| filter.map_or(true, |filter| filter.matches(&record.metadata)))
            .map(|record| SearchHit {
                id: record.id.clone(),
                text: record.text.clone(),
                score: cosine_similarity(query, &record.vector),
                metadata: record.metadata.clone(),
            })
            .collect();

        Ok(rank_hits(hits, fetch))
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.state.read().await.records.len())
    }

    async fn reset(&self) -> Result<(), IndexError> {
        let mut state = self.state.write().await;
        self.write_snapshot(&BTreeMap::new()).await?;
        state.records.clear();
        state.log_entries = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordMetadata;

    fn record(document_id: i64, page: u32, index: u32, vector: Vec<f32>) -> VectorRecord {
        let metadata = RecordMetadata {
            document_id,
            source: "manual.pdf".to_string(),
            page,
            batch: "feedbeef".to_string(),
            index,
            length: 7,
            timestamp: 1.5,
        };
        VectorRecord {
            id: metadata.record_id(),
            text: format!("page {page} chunk {index}"),
            vector,
            metadata,
        }
    }

    #[tokio::test]
    async fn change_log_replays_through_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let dropped = record(1, 3, 2, vec![0.5, 0.5]);
        {
            let index = FlatVectorIndex::open(dir.path())?;
            index
                .insert(&[record(1, 1, 0, vec![1.0, 0.0]), record(1, 2, 1, vec![0.0, 1.0])])
                .await?;
            index.insert(&[dropped.clone()]).await?;
            index.delete(&RecordSelector::Ids(vec![dropped.id.clone()])).await?;
        }
        assert!(!dir.path().join(COLLECTION_FILE).exists());

        let reopened = FlatVectorIndex::open(dir.path())?;
        assert_eq!(reopened.count().await?, 2);

        let hits = reopened.search(&[0.0, 1.0], 1, None).await?;
        assert_eq!(hits[0].metadata.page, 2);
        Ok(())
    }

    #[tokio::test]
    async fn compaction_folds_the_log_into_a_snapshot() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        {
            let index = FlatVectorIndex::open(dir.path())?.with_compaction_after(2);
            index.insert(&[record(1, 1, 0, vec![1.0, 0.0])]).await?;
            assert!(dir.path().join(LOG_FILE).exists());
            index.insert(&[record(1, 2, 1, vec![0.0, 1.0])]).await?;
        }
        assert!(!dir.path().join(LOG_FILE).exists());
        assert!(dir.path().join(COLLECTION_FILE).exists());
        assert!(!dir.path().join("collection.json.tmp").exists());

        let reopened = FlatVectorIndex::open(dir.path())?;
        assert_eq!(reopened.count().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn torn_last_entry_is_dropped_on_open() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        {
            let index = FlatVectorIndex::open(dir.path())?;
            index.insert(&[record(1, 1, 0, vec![1.0, 0.0])]).await?;
        }
        let log = dir.path().join(LOG_FILE);
        let intact = std::fs::metadata(&log)?.len();
        let mut file = OpenOptions::new().append(true).open(&log)?;
        file.write_all(br#"{"op":"upsert","rec"#)?;
        drop(file);

        let reopened = FlatVectorIndex::open(dir.path())?;
        assert_eq!(reopened.count().await?, 1);
        assert_eq!(std::fs::metadata(&log)?.len(), intact);
        Ok(())
    }

    #[tokio::test]
    async fn failed_append_leaves_records_untouched() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let index = FlatVectorIndex::open(dir.path())?;
        std::fs::create_dir(dir.path().join(LOG_FILE))?;

        assert!(index.insert(&[record(1, 1, 0, vec![1.0, 0.0])]).await.is_err());
        assert_eq!(index.count().await?, 0);
        assert!(index.search(&[1.0, 0.0], 5, None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_by_ids_and_page_filter() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let index = FlatVectorIndex::open(dir.path())?;
        let first = record(1, 1, 0, vec![1.0, 0.0]);
        index
            .insert(&[first.clone(), record(1, 2, 1, vec![0.5, 0.5]), record(1, 2, 2, vec![0.2, 0.8])])
            .await?;

        let page_two = RecordFilter {
            page: Some(2),
            ..RecordFilter::default()
        };
        assert_eq!(index.delete(&RecordSelector::Filter(page_two)).await?, 2);
        assert_eq!(index.delete(&RecordSelector::Ids(vec![first.id])).await?, 1);
        assert_eq!(index.delete(&RecordSelector::Ids(vec!["missing".to_string()])).await?, 0);
        assert_eq!(index.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn reset_clears_snapshot_and_log() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let index = FlatVectorIndex::open(dir.path())?;
        index.insert(&[record(1, 1, 0, vec![1.0, 0.0])]).await?;

        index.reset().await?;
        assert_eq!(index.count().await?, 0);
        assert!(!dir.path().join(LOG_FILE).exists());
        assert_eq!(FlatVectorIndex::open(dir.path())?.count().await?, 0);
        Ok(())
    }

    #[test]
    fn manifest_count_mismatch_is_corruption() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec(&Manifest {
                format_version: FORMAT_VERSION,
                backend: BACKEND.to_string(),
                record_count: 3,
            })?,
        )?;
        std::fs::write(dir.path().join(COLLECTION_FILE), b"[]")?;

        assert!(matches!(
            FlatVectorIndex::open(dir.path()),
            Err(IndexError::Corrupted { .. })
        ));
        Ok(())
    }

    #[test]
    fn garbage_inside_the_log_is_corruption() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(LOG_FILE), b"not json\n")?;

        assert!(matches!(
            FlatVectorIndex::open(dir.path()),
            Err(IndexError::Corrupted { .. })
        ));
        Ok(())
    }
}
