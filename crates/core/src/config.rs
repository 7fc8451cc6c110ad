use crate::chunking::ChunkingConfig;
use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_PIXELS: u64 = 5_000_000;
pub const DEFAULT_MAX_IMAGES_PER_PAGE: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_bytes: usize,
    pub max_pixels: u64,
    /// Zero disables the per-page cap.
    pub max_per_page: usize,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_pixels: DEFAULT_MAX_IMAGE_PIXELS,
            max_per_page: DEFAULT_MAX_IMAGES_PER_PAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackendKind {
    #[default]
    Sqlite,
    Flat,
}

impl FromStr for VectorBackendKind {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "flat" | "json" => Ok(Self::Flat),
            other => Err(IngestError::InvalidArgument(format!(
                "unknown vector backend '{other}' (expected sqlite or flat)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingDevice {
    #[default]
    Cpu,
    Cuda,
    Metal,
    Auto,
}

impl FromStr for EmbeddingDevice {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowered = value.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "" | "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            "mps" | "metal" => Ok(Self::Metal),
            name if name == "cuda" || name.starts_with("cuda:") => Ok(Self::Cuda),
            other => Err(IngestError::InvalidArgument(format!(
                "unknown embedding device '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for EmbeddingDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Auto => "auto",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingSettings {
    pub device: EmbeddingDevice,
    pub dimensions: usize,
    /// Remote OpenAI-compatible endpoint; the local hashing embedder is used when unset.
    pub endpoint: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            device: EmbeddingDevice::Cpu,
            dimensions: 384,
            endpoint: None,
            model: "all-MiniLM-L6-v2".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OcrSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    pub directory: PathBuf,
    pub poll_interval: Duration,
    pub max_workers: usize,
}

impl WatchSettings {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            poll_interval: Duration::from_secs(5),
            max_workers: 1,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_path: PathBuf,
    pub watch: Option<WatchSettings>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub images: ImageLimits,
    pub vector_backend: VectorBackendKind,
    pub vector_dir: PathBuf,
    pub embedding: EmbeddingSettings,
    pub ocr: OcrSettings,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./pdf_knowledge_base.db"),
            watch: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            images: ImageLimits::default(),
            vector_backend: VectorBackendKind::default(),
            vector_dir: PathBuf::from("./vector_db"),
            embedding: EmbeddingSettings::default(),
            ocr: OcrSettings::default(),
        }
    }
}

impl IngestConfig {
    pub fn chunking(&self) -> Result<ChunkingConfig, IngestError> {
        ChunkingConfig::new(self.chunk_size, self.chunk_overlap)
    }
}
