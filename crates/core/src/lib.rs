pub mod catalog;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod images;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod records;
pub mod status;
pub mod stores;
pub mod supervisor;
pub mod traits;
pub mod vector_store;

#[cfg(test)]
mod test_support;

pub use catalog::{
    blacklist_document, list_blacklisted, register_upload, remove_document,
    reset_interrupted_processing, unblacklist_document, BlacklistTarget,
};
pub use chunking::{prepare_chunks, split_text, ChunkingConfig, DocumentText, PreparedChunks};
pub use config::{
    EmbeddingDevice, EmbeddingSettings, ImageLimits, IngestConfig, OcrSettings,
    VectorBackendKind, WatchSettings,
};
pub use embeddings::{
    load_embedder, CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IndexError, IngestError, StoreError};
pub use extractor::{
    ocr_engine_from_settings, DisabledOcr, ExtractionEngine, ExtractionOutcome, HttpOcrEngine,
    OcrEngine,
};
pub use ingest::discover_pdf_files;
pub use models::{
    Document, DocumentFilter, DocumentId, PageText, RecordFilter, RecordSelector, SearchHit,
    SearchPage,
};
pub use pipeline::{IngestOutcome, IngestReport, IngestionPipeline};
pub use records::{RecordStore, SqliteRecordStore};
pub use status::{
    ChannelSink, IngestStage, NotificationSink, NullSink, ProcessingEvent, ProcessingStatus,
    StatusBoard, StatusEmitter,
};
pub use stores::{open_index, FlatVectorIndex, Recovery, SqliteVectorIndex};
pub use supervisor::{DirectoryIngestSupervisor, SupervisorHandle};
pub use traits::VectorIndex;
pub use vector_store::{open_vector_store, RebuildReport, RebuildStatus, VectorStore};
