use chrono::Utc;
use clap::{Parser, Subcommand};
use pdfkb_core::{
    blacklist_document, list_blacklisted, load_embedder, ocr_engine_from_settings, open_index,
    open_vector_store, register_upload, remove_document, reset_interrupted_processing,
    unblacklist_document, BlacklistTarget, ChannelSink, DirectoryIngestSupervisor, Document,
    DocumentFilter, EmbeddingDevice, EmbeddingSettings, ExtractionEngine, ImageLimits,
    IngestConfig, IngestOutcome, IngestionPipeline, NotificationSink, OcrSettings,
    RebuildReport, RebuildStatus, RecordFilter, RecordStore, SqliteRecordStore,
    VectorBackendKind, VectorStore, WatchSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "pdfkb", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database holding document records and extracted pages
    #[arg(long, env = "PDF_RAG_DATABASE", default_value = "./pdf_knowledge_base.db")]
    database: PathBuf,

    /// Vector backend: sqlite or flat
    #[arg(long, env = "PDF_RAG_VECTOR_BACKEND", default_value = "sqlite")]
    vector_backend: VectorBackendKind,

    /// Directory the vector backend persists into
    #[arg(long, env = "PDF_RAG_VECTOR_DIR", default_value = "./vector_db")]
    vector_dir: PathBuf,

    /// Chunk size in characters
    #[arg(long, env = "PDF_RAG_CHUNK_SIZE", default_value = "1000")]
    chunk_size: usize,

    /// Overlap between consecutive chunks in characters
    #[arg(long, env = "PDF_RAG_CHUNK_OVERLAP", default_value = "200")]
    chunk_overlap: usize,

    /// Largest encoded inline image kept, in bytes
    #[arg(long, env = "PDF_IMAGE_MAX_BYTES", default_value = "2097152")]
    image_max_bytes: usize,

    /// Largest inline image kept, in pixels
    #[arg(long, env = "PDF_IMAGE_MAX_PIXELS", default_value = "5000000")]
    image_max_pixels: u64,

    /// Inline images kept per page (0 = unlimited)
    #[arg(long, env = "PDF_IMAGE_MAX_PER_PAGE", default_value = "8")]
    image_max_per_page: usize,

    /// Preferred embedding device: cpu, cuda, metal or auto
    #[arg(long, env = "SENTENCE_TRANSFORMERS_DEVICE", default_value = "cpu")]
    embedding_device: EmbeddingDevice,

    /// OpenAI-compatible embeddings endpoint; the local hashing embedder is used when unset
    #[arg(long, env = "PDF_RAG_EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    /// Embedding model name sent to the endpoint
    #[arg(long, env = "PDF_RAG_EMBEDDING_MODEL", default_value = "all-MiniLM-L6-v2")]
    embedding_model: String,

    /// Bearer token for the embeddings endpoint
    #[arg(long, env = "PDF_RAG_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Embedding dimensions
    #[arg(long, env = "PDF_RAG_EMBEDDING_DIMENSIONS", default_value = "384")]
    embedding_dimensions: usize,

    /// OCR endpoint used when a PDF has no text layer; image-only PDFs are blacklisted when unset
    #[arg(long, env = "LLM_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// Bearer token for the OCR endpoint
    #[arg(long, env = "LLM_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile interrupted work, then watch a directory until Ctrl-C.
    Serve {
        /// Directory polled for PDFs; nothing is watched when unset.
        #[arg(long, env = "PDF_RAG_WATCH_DIR")]
        watch_dir: Option<PathBuf>,
        /// Seconds between scans.
        #[arg(long, env = "PDF_RAG_WATCH_INTERVAL", default_value = "5")]
        watch_interval: f64,
        /// Documents processed concurrently.
        #[arg(long, env = "PDF_RAG_WATCH_MAX_WORKERS", default_value = "1")]
        max_workers: usize,
        /// Print processing updates to stdout as JSON lines.
        #[arg(long, default_value_t = false)]
        events: bool,
    },
    /// Ingest a single PDF and wait for it to finish.
    Ingest {
        file: PathBuf,
    },
    /// Similarity search over indexed chunks.
    Search {
        query: String,
        #[arg(long, default_value = "5")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Restrict to one document id.
        #[arg(long)]
        document: Option<i64>,
        /// Restrict to one page number.
        #[arg(long)]
        page: Option<u32>,
    },
    /// List document records.
    Documents {
        #[arg(long, default_value_t = false)]
        blacklisted: bool,
    },
    /// Print the stored markdown of a document.
    Pages {
        id: i64,
    },
    /// Remove a document, its pages and its vectors.
    Remove {
        id: i64,
        /// Also delete the PDF from disk.
        #[arg(long, default_value_t = false)]
        delete_file: bool,
    },
    /// Manage the blacklist.
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },
    /// Rebuild an empty vector index from stored pages.
    Rebuild,
    /// Drop every vector and rebuild from stored pages.
    Reset,
    /// Number of records in the vector index.
    Count,
}

#[derive(Subcommand)]
enum BlacklistAction {
    List,
    Add {
        #[arg(long, required_unless_present = "filename")]
        id: Option<i64>,
        #[arg(long, conflicts_with = "id")]
        filename: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    Remove {
        id: i64,
    },
}

impl Cli {
    fn config(&self, watch: Option<WatchSettings>) -> IngestConfig {
        IngestConfig {
            database_path: self.database.clone(),
            watch,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            images: ImageLimits {
                max_bytes: self.image_max_bytes,
                max_pixels: self.image_max_pixels,
                max_per_page: self.image_max_per_page,
            },
            vector_backend: self.vector_backend,
            vector_dir: self.vector_dir.clone(),
            embedding: EmbeddingSettings {
                device: self.embedding_device,
                dimensions: self.embedding_dimensions,
                endpoint: self.embedding_endpoint.clone(),
                model: self.embedding_model.clone(),
                api_key: self.embedding_api_key.clone(),
            },
            ocr: OcrSettings {
                endpoint: self.ocr_endpoint.clone(),
                api_key: self.ocr_api_key.clone(),
            },
        }
    }
}

struct Services {
    records: Arc<dyn RecordStore>,
    vectors: Arc<VectorStore>,
    pipeline: Arc<IngestionPipeline>,
}

/// Opens the stores and wires the pipeline. With `background_rebuild` a recovered or empty
/// index is rebuilt on a background task; one-shot commands rebuild explicitly instead.
async fn open_services(
    config: &IngestConfig,
    sink: Arc<dyn NotificationSink>,
    background_rebuild: bool,
) -> anyhow::Result<Services> {
    let chunking = config.chunking()?;
    let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&config.database_path)?);
    let embedder = load_embedder(&config.embedding)?;

    let vectors = if background_rebuild {
        let (vectors, _) =
            open_vector_store(config, Arc::clone(&records), embedder, chunking).await?;
        vectors
    } else {
        let (index, recovery) = open_index(config.vector_backend, &config.vector_dir)?;
        if recovery.recovered() {
            warn!(?recovery, "vector index was recovered, run `pdfkb rebuild` to restore it");
        }
        Arc::new(VectorStore::new(index, Arc::clone(&records), embedder, chunking))
    };

    let extraction = ExtractionEngine::new(config.images, ocr_engine_from_settings(&config.ocr)?);
    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&records),
        Arc::clone(&vectors),
        extraction,
        chunking,
        sink,
    ));

    Ok(Services {
        records,
        vectors,
        pipeline,
    })
}

async fn rebuild_to_completion(vectors: &VectorStore) -> anyhow::Result<RebuildReport> {
    loop {
        let report = vectors.rebuild().await?;
        if report.status != RebuildStatus::AlreadyRunning {
            return Ok(report);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn print_document(document: &Document) {
    let state = if document.blacklisted {
        "blacklisted"
    } else if document.processing {
        "processing"
    } else if document.processed {
        "processed"
    } else {
        "pending"
    };
    println!(
        "{:>5}  {:<11} pages={:<4} chunks={:<5} {}",
        document.id, state, document.page_count, document.chunk_count, document.filename
    );
    if let Some(error) = &document.error {
        println!("       error: {error}");
    }
    if let Some(reason) = &document.blacklist_reason {
        println!("       blacklist reason: {reason}");
    }
}

fn print_rebuild(report: &RebuildReport) {
    println!(
        "rebuild: status={:?} documents={} chunks={} skipped={} failed={}",
        report.status,
        report.documents,
        report.chunks,
        report.skipped_documents,
        report.failed_documents
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdfkb boot"
    );

    match &cli.command {
        Command::Serve {
            watch_dir,
            watch_interval,
            max_workers,
            events,
        } => {
            let watch = watch_dir.as_ref().map(|directory| {
                WatchSettings::new(directory)
                    .with_poll_interval(Duration::from_secs_f64(watch_interval.max(0.1)))
                    .with_max_workers(*max_workers)
            });
            let config = cli.config(watch);
            let sink = Arc::new(ChannelSink::new(256));
            let services = open_services(&config, sink.clone(), true).await?;

            let reset = reset_interrupted_processing(
                services.records.as_ref(),
                services.pipeline.statuses(),
            )?;
            if reset > 0 {
                info!(documents = reset, "reset interrupted processing");
            }

            if *events {
                let mut receiver = sink.subscribe();
                tokio::spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(event) => match serde_json::to_string(&event) {
                                Ok(line) => println!("{line}"),
                                Err(error) => warn!(%error, "failed to serialize processing event"),
                            },
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "event printer fell behind")
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
            }

            let handle = match config.watch {
                Some(settings) => Some(
                    DirectoryIngestSupervisor::new(settings, Arc::clone(&services.pipeline))
                        .start()?,
                ),
                None => {
                    info!("no watch directory configured");
                    None
                }
            };

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            if let Some(handle) = handle {
                handle.stop(STOP_TIMEOUT).await;
            }
        }
        Command::Ingest { file } => {
            let config = cli.config(None);
            let services = open_services(&config, Arc::new(pdfkb_core::NullSink), false).await?;
            let path = std::fs::canonicalize(file)?;
            let document = register_upload(services.records.as_ref(), &path)?;

            let report = services
                .pipeline
                .process(document.id, &path, &document.filename)
                .await?;
            match report.outcome {
                IngestOutcome::Completed { chunks } => {
                    println!("{}: {chunks} chunks indexed (id {})", document.filename, document.id)
                }
                IngestOutcome::Blacklisted { reason } => {
                    println!("{}: blacklisted: {reason}", document.filename)
                }
                IngestOutcome::Failed { reason } => {
                    anyhow::bail!("{}: {reason}", document.filename)
                }
            }
        }
        Command::Search {
            query,
            limit,
            offset,
            document,
            page,
        } => {
            let config = cli.config(None);
            let services = open_services(&config, Arc::new(pdfkb_core::NullSink), false).await?;
            let filter = RecordFilter {
                document_id: *document,
                source: None,
                page: *page,
            };
            let filter = (!filter.is_empty()).then_some(filter);

            let results = services
                .vectors
                .search_text(query, *limit, filter.as_ref(), *offset)
                .await?;
            println!("query: {query}");
            for (rank, hit) in results.hits.iter().enumerate() {
                println!(
                    "{}. score={:.4} source={} page={} id={}",
                    results.offset + rank + 1,
                    hit.score,
                    hit.metadata.source,
                    hit.metadata.page,
                    hit.id
                );
                println!("  {}", hit.text.replace('\n', " "));
            }
            if results.has_more {
                println!("more results available at --offset {}", results.offset + results.limit);
            }
        }
        Command::Documents { blacklisted } => {
            let records = SqliteRecordStore::open(&cli.database)?;
            let filter = if *blacklisted {
                DocumentFilter::blacklisted()
            } else {
                DocumentFilter::default()
            };
            for document in records.query_documents(&filter)? {
                print_document(&document);
            }
        }
        Command::Pages { id } => {
            let records = SqliteRecordStore::open(&cli.database)?;
            let document = records
                .get_document(*id)?
                .ok_or_else(|| anyhow::anyhow!("document {id} not found"))?;
            if document.blacklisted {
                anyhow::bail!("document {} is blacklisted", document.filename);
            }
            for page in records.pages(*id)? {
                println!("<!-- page {} -->\n{}\n", page.page, page.markdown);
            }
        }
        Command::Remove { id, delete_file } => {
            let config = cli.config(None);
            let services = open_services(&config, Arc::new(pdfkb_core::NullSink), false).await?;
            let removed = remove_document(
                services.records.as_ref(),
                &services.vectors,
                services.pipeline.statuses(),
                *id,
                *delete_file,
            )
            .await?;
            println!("document {} deleted", removed.filename);
        }
        Command::Blacklist { action } => {
            let records = SqliteRecordStore::open(&cli.database)?;
            match action {
                BlacklistAction::List => {
                    for document in list_blacklisted(&records)? {
                        print_document(&document);
                    }
                }
                BlacklistAction::Add {
                    id,
                    filename,
                    reason,
                } => {
                    let target = match (id, filename) {
                        (Some(id), _) => BlacklistTarget::Id(*id),
                        (None, Some(filename)) => BlacklistTarget::Filename(filename.clone()),
                        (None, None) => anyhow::bail!("either --id or --filename is required"),
                    };
                    let document = blacklist_document(&records, &target, reason.clone())?;
                    println!("{} blacklisted (id {})", document.filename, document.id);
                }
                BlacklistAction::Remove { id } => {
                    let document = unblacklist_document(&records, *id)?;
                    println!("{} removed from blacklist", document.filename);
                }
            }
        }
        Command::Rebuild => {
            let config = cli.config(None);
            let services = open_services(&config, Arc::new(pdfkb_core::NullSink), false).await?;
            print_rebuild(&rebuild_to_completion(&services.vectors).await?);
        }
        Command::Reset => {
            let config = cli.config(None);
            let services = open_services(&config, Arc::new(pdfkb_core::NullSink), false).await?;
            services.vectors.reset().await?;
            print_rebuild(&rebuild_to_completion(&services.vectors).await?);
        }
        Command::Count => {
            let config = cli.config(None);
            let services = open_services(&config, Arc::new(pdfkb_core::NullSink), false).await?;
            println!(
                "{} records in {} index",
                services.vectors.count().await?,
                services.vectors.backend()
            );
        }
    }

    Ok(())
}
