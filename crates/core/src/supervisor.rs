//! Polls a directory for PDFs and feeds new or changed files to the ingestion pipeline
//! through a bounded worker pool.

use crate::config::WatchSettings;
use crate::error::IngestError;
use crate::ingest::{discover_pdf_files, display_name};
use crate::models::{DocumentId, FileStat, NewDocument, RecordFilter, RecordSelector};
use crate::pipeline::IngestionPipeline;
use crate::status::IngestStage;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct Job {
    document_id: DocumentId,
    path: PathBuf,
    name: String,
    purge: bool,
}

struct Shared {
    settings: WatchSettings,
    pipeline: Arc<IngestionPipeline>,
    /// Paths queued or being processed. Also serialises the record check-and-mark.
    active: Mutex<HashSet<PathBuf>>,
    permits: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn workers(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decides whether `path` needs (re)processing and, if so, marks its record as
    /// processing and the path as active before anyone else can look at it.
    fn claim(&self, path: &Path) -> Result<Option<Job>, IngestError> {
        let stat = match FileStat::read(path) {
            Ok(stat) => stat,
            Err(error) => {
                warn!(path = %path.display(), %error, "unable to stat watched file");
                return Ok(None);
            }
        };
        let name = display_name(&self.settings.directory, path);
        let file_path = path.display().to_string();
        let records = self.pipeline.records();

        let mut active = self.active();
        if active.contains(path) {
            return Ok(None);
        }

        let job = match records.find_by_path(&file_path)? {
            Some(mut document) => {
                if document.processing {
                    debug!(filename = %document.filename, "skipping, already processing");
                    return Ok(None);
                }
                if document.blacklisted {
                    debug!(filename = %document.filename, "skipping blacklisted file");
                    return Ok(None);
                }
                if document.processed && !document.file_changed(&stat) {
                    return Ok(None);
                }

                info!(filename = %document.filename, "detected updated PDF, scheduling reprocessing");
                document.processing = true;
                document.processed = false;
                document.error = None;
                document.progress = 0.0;
                document.file_size = stat.size;
                document.file_modified_at = stat.modified_at;
                records.update_document(&document)?;

                Job {
                    document_id: document.id,
                    path: path.to_path_buf(),
                    name: document.filename,
                    purge: true,
                }
            }
            None => {
                if let Some(existing) = records.find_by_filename(&name)? {
                    warn!(
                        filename = %name,
                        existing = %existing.file_path,
                        "a document with this name already exists, skipping"
                    );
                    return Ok(None);
                }

                info!(filename = %name, "detected new PDF, scheduling ingestion");
                let document = records.create_document(&NewDocument {
                    filename: name,
                    file_path,
                    file_size: stat.size,
                    file_modified_at: stat.modified_at,
                    processing: true,
                })?;

                Job {
                    document_id: document.id,
                    path: path.to_path_buf(),
                    name: document.filename,
                    purge: false,
                }
            }
        };

        active.insert(path.to_path_buf());
        Ok(Some(job))
    }

    fn release(&self, path: &Path) {
        self.active().remove(path);
    }
}

async fn run_job(shared: Arc<Shared>, job: Job) {
    let pipeline = &shared.pipeline;

    match Arc::clone(&shared.permits).acquire_owned().await {
        Err(_) => {
            info!(filename = %job.name, "worker pool shut down, cancelling queued document");
            if let Err(error) = pipeline.cancel_queued(job.document_id) {
                warn!(document_id = job.document_id, %error, "failed to cancel queued document");
            }
        }
        Ok(_permit) => match pipeline.process(job.document_id, &job.path, &job.name).await {
            Ok(report) => debug!(filename = %job.name, outcome = ?report.outcome, "worker finished"),
            Err(error) => {
                error!(filename = %job.name, %error, "error processing watched file");
                let status = pipeline.statuses().update(job.document_id, &job.name, |status| {
                    status.advance(IngestStage::Failed, format!("Error: {error}"), 0.0)
                });
                pipeline.emitter().emit(job.document_id, &status);
                pipeline.statuses().remove(job.document_id);
            }
        },
    }

    shared.release(&job.path);
}

/// Scans a watch directory and hands new or changed PDFs to the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct DirectoryIngestSupervisor {
    shared: Arc<Shared>,
}

impl DirectoryIngestSupervisor {
    pub fn new(settings: WatchSettings, pipeline: Arc<IngestionPipeline>) -> Self {
        let workers = settings.max_workers.max(1);
        Self {
            shared: Arc::new(Shared {
                settings,
                pipeline,
                active: Mutex::new(HashSet::new()),
                permits: Arc::new(Semaphore::new(workers)),
                workers: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.shared.settings.directory
    }

    pub fn active_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.shared.active().iter().cloned().collect::<Vec<_>>();
        paths.sort();
        paths
    }

    /// One pass over the watch directory. Returns how many files were dispatched; the
    /// workers run in the background.
    pub async fn scan_once(&self) -> Result<usize, IngestError> {
        let directory = self.shared.settings.directory.clone();
        if !directory.is_dir() {
            warn!(directory = %directory.display(), "watch directory does not exist");
            return Ok(0);
        }

        let files = tokio::task::spawn_blocking(move || discover_pdf_files(&directory)).await?;
        let mut dispatched = 0;

        for path in files {
            let job = match self.shared.claim(&path) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(error) => {
                    error!(path = %path.display(), %error, "failed to schedule watched file");
                    continue;
                }
            };

            let pipeline = &self.shared.pipeline;
            if job.purge {
                let purge = RecordSelector::Filter(RecordFilter::document(job.document_id));
                match pipeline.vectors().delete(&purge).await {
                    Ok(deleted) => debug!(filename = %job.name, deleted, "purged previous vectors"),
                    Err(error) => {
                        error!(filename = %job.name, %error, "failed to purge previous vectors")
                    }
                }
            }
            pipeline.mark_queued(job.document_id, &job.name);

            self.shared
                .workers()
                .spawn(run_job(Arc::clone(&self.shared), job));
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Waits for every dispatched worker to finish.
    pub async fn wait_idle(&self) {
        loop {
            let mut workers = std::mem::take(&mut *self.shared.workers());
            if workers.is_empty() {
                return;
            }
            while let Some(result) = workers.join_next().await {
                if let Err(error) = result {
                    error!(%error, "ingest worker panicked");
                }
            }
        }
    }

    /// Closes the worker pool: queued jobs are cancelled, running ones finish.
    pub async fn shutdown(&self) {
        self.shared.permits.close();
        self.wait_idle().await;
    }

    /// Creates the watch directory if needed and starts polling it.
    pub fn start(self) -> Result<SupervisorHandle, IngestError> {
        let directory = &self.shared.settings.directory;
        if !directory.is_dir() {
            info!(directory = %directory.display(), "creating watch directory");
            std::fs::create_dir_all(directory)?;
        }

        let (stop, mut stopped) = watch::channel(false);
        let supervisor = self.clone();
        let interval = self.shared.settings.poll_interval;

        let scan = tokio::spawn(async move {
            while !*stopped.borrow() {
                match supervisor.scan_once().await {
                    Ok(0) => {}
                    Ok(dispatched) => debug!(dispatched, "scan dispatched files"),
                    Err(error) => error!(%error, "error while scanning watch directory"),
                }
                supervisor.reap_finished();

                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        info!(
            directory = %self.shared.settings.directory.display(),
            max_workers = self.shared.settings.max_workers,
            "started PDF directory watcher"
        );
        Ok(SupervisorHandle {
            supervisor: self,
            stop,
            scan,
        })
    }

    fn reap_finished(&self) {
        let mut workers = self.shared.workers();
        while let Some(result) = workers.try_join_next() {
            if let Err(error) = result {
                error!(%error, "ingest worker panicked");
            }
        }
    }
}

pub struct SupervisorHandle {
    supervisor: DirectoryIngestSupervisor,
    stop: watch::Sender<bool>,
    scan: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn supervisor(&self) -> &DirectoryIngestSupervisor {
        &self.supervisor
    }

    /// Stops scanning, cancels queued work and waits for running documents to finish.
    pub async fn stop(mut self, timeout: Duration) {
        if self.stop.send(true).is_err() {
            debug!("scan loop already exited");
        }
        match tokio::time::timeout(timeout, &mut self.scan).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => error!(%error, "scan loop panicked"),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "scan loop did not stop in time, aborting it");
                self.scan.abort();
                if let Err(error) = (&mut self.scan).await {
                    if !error.is_cancelled() {
                        error!(%error, "scan loop panicked");
                    }
                }
            }
        }

        self.supervisor.shutdown().await;
        info!(
            directory = %self.supervisor.directory().display(),
            "stopped PDF directory watcher"
        );
    }
}
