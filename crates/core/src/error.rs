use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("cannot find pdf file: {0}")]
    MissingFile(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR failed: {0}")]
    OcrFailed(String),

    #[error("text split into chunks but no content")]
    EmptyChunks,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("vector index error: {0}")]
    Index(#[from] IndexError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{backend} storage is corrupted: {details}")]
    Corrupted { backend: String, details: String },

    #[error("invalid index request: {0}")]
    InvalidInput(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document {0} not found")]
    DocumentNotFound(i64),

    #[error("cannot prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored value in column {column}: {details}")]
    InvalidValue { column: String, details: String },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
