use crate::config::{EmbeddingDevice, EmbeddingSettings};
use crate::error::IngestError;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT: usize = 384;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Maps a batch of texts to vectors of a fixed dimensionality, preserving input order.
/// Calls block; async callers run them on a blocking thread.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError>;

    fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| IngestError::Embedding("embedder returned no vector".to_string()))
    }
}

const NGRAM: usize = 3;
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Local embedder that hashes character trigrams into a fixed number of buckets and
/// L2-normalises the counts. Text is lower-cased and whitespace runs are collapsed first,
/// so the same words extracted with a different page layout embed identically.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// The hashing embedder has no accelerator backend.
    pub fn on_device(dimensions: usize, device: EmbeddingDevice) -> Result<Self, IngestError> {
        match device {
            EmbeddingDevice::Cpu | EmbeddingDevice::Auto => Ok(Self::new(dimensions)),
            other => Err(IngestError::Embedding(format!(
                "device '{other}' is not available for the n-gram embedder"
            ))),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return vector;
        }

        // Texts shorter than one n-gram still get a single bucket.
        let chars = normalized.chars().collect::<Vec<_>>();
        for gram in chars.windows(NGRAM.min(chars.len())) {
            let bucket = (fnv1a(gram) % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|value| *value /= norm);
        }
        vector
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn fnv1a(chars: &[char]) -> u64 {
    let mut buffer = [0u8; 4];
    chars.iter().fold(FNV_OFFSET, |hash, ch| {
        ch.encode_utf8(&mut buffer)
            .bytes()
            .fold(hash, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME))
    })
}

impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint. The blocking client is built per call so it
/// is never created or dropped on an async worker thread.
pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        dimensions: usize,
    ) -> Result<Self, IngestError> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            return Err(IngestError::InvalidArgument(
                "embedding endpoint is empty".to_string(),
            ));
        }

        Ok(Self {
            endpoint,
            model: model.into(),
            api_key,
            dimensions,
        })
    }
}

impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = Client::new().post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(IngestError::Embedding(format!(
                "embedding request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: EmbeddingResponse = response.json()?;
        order_embeddings(payload, texts.len(), self.dimensions)
    }
}

fn order_embeddings(
    payload: EmbeddingResponse,
    expected: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, IngestError> {
    if payload.data.len() != expected {
        return Err(IngestError::Embedding(format!(
            "expected {expected} embeddings, got {}",
            payload.data.len()
        )));
    }

    let mut items = payload
        .data
        .into_iter()
        .enumerate()
        .map(|(position, item)| (item.index.unwrap_or(position), item.embedding))
        .collect::<Vec<_>>();
    items.sort_by_key(|(index, _)| *index);

    items
        .into_iter()
        .map(|(_, embedding)| {
            if embedding.len() == dimensions {
                Ok(embedding)
            } else {
                Err(IngestError::Embedding(format!(
                    "embedding dimension {} != {dimensions}",
                    embedding.len()
                )))
            }
        })
        .collect()
}

/// Runs `embed_batch` on the blocking pool.
pub async fn embed_on_blocking_pool(
    embedder: &Arc<dyn Embedder>,
    texts: Vec<String>,
) -> Result<Vec<Vec<f32>>, IngestError> {
    let embedder = Arc::clone(embedder);
    tokio::task::spawn_blocking(move || embedder.embed_batch(&texts)).await?
}

fn load_on_device(
    settings: &EmbeddingSettings,
    device: EmbeddingDevice,
) -> Result<Arc<dyn Embedder>, IngestError> {
    match &settings.endpoint {
        Some(endpoint) => Ok(Arc::new(HttpEmbedder::new(
            endpoint.clone(),
            settings.model.clone(),
            settings.api_key.clone(),
            settings.dimensions,
        )?)),
        None => Ok(Arc::new(CharacterNgramEmbedder::on_device(
            settings.dimensions,
            device,
        )?)),
    }
}

/// Loads the configured embedder on the preferred device, falling back to the CPU when
/// the preferred device cannot be initialised.
pub fn load_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>, IngestError> {
    info!(device = %settings.device, model = %settings.model, "loading embedder");

    match load_on_device(settings, settings.device) {
        Ok(embedder) => Ok(embedder),
        Err(error) if settings.device != EmbeddingDevice::Cpu => {
            warn!(
                device = %settings.device,
                %error,
                "failed to load embedder on requested device, falling back to cpu"
            );
            load_on_device(settings, EmbeddingDevice::Cpu)
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let texts = vec!["Hydraulic pressure and flow".to_string()];
        let first = embedder.embed_batch(&texts).unwrap();
        let second = embedder.embed_batch(&texts).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length_in_input_order() {
        let embedder = CharacterNgramEmbedder::new(32);
        let texts = vec!["abc".to_string(), "xyz".to_string()];
        let vectors = embedder.embed_batch(&texts).unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 32);
        assert_eq!(vectors[0], embedder.embed("abc").unwrap());
        assert_eq!(vectors[1], embedder.embed("xyz").unwrap());
    }

    #[test]
    fn layout_whitespace_and_case_do_not_change_vectors() {
        let embedder = CharacterNgramEmbedder::new(64);
        let flowing = embedder.embed("Hydraulic pressure and flow").unwrap();
        let wrapped = embedder.embed("  HYDRAULIC pressure\n\nand\tflow ").unwrap();
        assert_eq!(flowing, wrapped);

        let norm = flowing.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn short_and_blank_texts() {
        let embedder = CharacterNgramEmbedder::new(8);
        assert!(embedder.embed("ab").unwrap().iter().any(|value| *value > 0.0));
        assert!(embedder.embed(" \n ").unwrap().iter().all(|value| *value == 0.0));
    }

    #[test]
    fn accelerator_request_falls_back_to_cpu() {
        let settings = EmbeddingSettings {
            device: EmbeddingDevice::Cuda,
            dimensions: 16,
            ..EmbeddingSettings::default()
        };

        let embedder = load_embedder(&settings).expect("cpu fallback should load");
        assert_eq!(embedder.dimensions(), 16);
    }

    #[test]
    fn remote_embeddings_are_reordered_by_index() {
        let payload = EmbeddingResponse {
            data: vec![
                EmbeddingItem {
                    index: Some(1),
                    embedding: vec![0.0, 1.0],
                },
                EmbeddingItem {
                    index: Some(0),
                    embedding: vec![1.0, 0.0],
                },
            ],
        };

        let ordered = order_embeddings(payload, 2, 2).expect("payload is complete");
        assert_eq!(ordered, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn remote_embeddings_with_wrong_dimension_are_rejected() {
        let payload = EmbeddingResponse {
            data: vec![EmbeddingItem {
                index: None,
                embedding: vec![1.0],
            }],
        };

        assert!(order_embeddings(payload, 1, 4).is_err());
    }
}
