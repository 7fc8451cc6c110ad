use crate::chunking::DocumentText;
use crate::config::{ImageLimits, OcrSettings};
use crate::error::IngestError;
use crate::images::{PageImage, PageImageExtractor};
use crate::models::{DocumentId, PageText};
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const EMPTY_DOCUMENT_REASON: &str = "No valid text content after PDF parsing or OCR fallback";

/// Turns a rendered page into text. Calls block.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &PageImage, source: &Path) -> Result<String, IngestError>;
}

/// Used when no OCR endpoint is configured: image-only documents end up blacklisted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledOcr;

impl OcrEngine for DisabledOcr {
    fn recognize(&self, _image: &PageImage, _source: &Path) -> Result<String, IngestError> {
        Err(IngestError::OcrFailed("no OCR engine configured".to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest<'a> {
    image_base64: String,
    mime_type: &'a str,
    page: u32,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    pages: Option<Vec<LlmOcrPage>>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    text: Option<String>,
}

/// Multimodal OCR over HTTP: one page image per request, `{text}` back.
#[derive(Debug, Clone)]
pub struct HttpOcrEngine {
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOcrEngine {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, IngestError> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            return Err(IngestError::InvalidArgument("OCR endpoint is empty".to_string()));
        }

        let api_key = api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        Ok(Self { endpoint, api_key })
    }
}

impl OcrEngine for HttpOcrEngine {
    fn recognize(&self, image: &PageImage, source: &Path) -> Result<String, IngestError> {
        let payload = LlmOcrRequest {
            image_base64: STANDARD.encode(&image.data),
            mime_type: image.mime_type,
            page: image.page,
            source_path: source.to_string_lossy().to_string(),
        };

        let mut request = Client::new()
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: LlmOcrResponse = response.json()?;
        Ok(response_text(payload))
    }
}

fn response_text(payload: LlmOcrResponse) -> String {
    if let Some(text) = payload.text.filter(|text| !text.trim().is_empty()) {
        return text;
    }

    payload
        .pages
        .unwrap_or_default()
        .into_iter()
        .filter_map(|page| page.text)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn ocr_engine_from_settings(settings: &OcrSettings) -> Result<Arc<dyn OcrEngine>, IngestError> {
    match settings.endpoint.as_deref().map(str::trim) {
        Some(endpoint) if !endpoint.is_empty() => Ok(Arc::new(HttpOcrEngine::new(
            endpoint,
            settings.api_key.clone(),
        )?)),
        _ => Ok(Arc::new(DisabledOcr)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionProgress {
    Parsing { current: u32, total: u32 },
    Ocr { current: u32, total: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    pub page: u32,
    /// Trimmed text followed by inline image markdown, separated by blank lines.
    pub markdown: String,
    pub image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub page_count: u32,
    /// Pages that produced any content, in page order.
    pub pages: Vec<ExtractedPage>,
    pub used_ocr: bool,
}

impl ExtractedDocument {
    pub fn image_count(&self) -> usize {
        self.pages.iter().map(|page| page.image_count).sum()
    }

    pub fn page_texts(&self, document_id: DocumentId) -> Vec<PageText> {
        self.pages
            .iter()
            .map(|page| PageText {
                document_id,
                page: page.page,
                markdown: page.markdown.clone(),
            })
            .collect()
    }

    /// The text that gets chunked, identical to what a rebuild derives from stored pages.
    pub fn document_text(&self, document_id: DocumentId) -> Result<DocumentText, IngestError> {
        DocumentText::from_markdown(&self.page_texts(document_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Text(ExtractedDocument),
    /// Neither the native text layer nor OCR produced anything.
    Empty { page_count: u32, reason: String },
}

pub struct ExtractionEngine {
    images: PageImageExtractor,
    ocr: Arc<dyn OcrEngine>,
}

impl ExtractionEngine {
    pub fn new(limits: ImageLimits, ocr: Arc<dyn OcrEngine>) -> Self {
        Self {
            images: PageImageExtractor::new(limits),
            ocr,
        }
    }

    pub fn extract(
        &self,
        path: &Path,
        on_progress: &mut dyn FnMut(ExtractionProgress),
    ) -> Result<ExtractionOutcome, IngestError> {
        if !path.is_file() {
            return Err(IngestError::MissingFile(path.display().to_string()));
        }

        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        let page_ids = document.get_pages();
        let total = page_ids.len() as u32;

        let mut seen_images = HashSet::new();
        let mut pages = Vec::new();
        let mut has_native_text = false;

        for (position, (&page, &page_id)) in page_ids.iter().enumerate() {
            let text = match document.extract_text(&[page]) {
                Ok(text) => text.trim().to_string(),
                Err(error) => {
                    warn!(path = %path.display(), page, %error, "failed to extract page text");
                    String::new()
                }
            };
            has_native_text |= !text.is_empty();

            let images = self.images.extract(&document, page, page_id, &mut seen_images);
            let mut parts = Vec::with_capacity(images.len() + 1);
            if !text.is_empty() {
                parts.push(text);
            }
            parts.extend(images.iter().map(PageImage::to_markdown));

            if !parts.is_empty() {
                pages.push(ExtractedPage {
                    page,
                    markdown: parts.join("\n\n"),
                    image_count: images.len(),
                });
            }

            on_progress(ExtractionProgress::Parsing {
                current: position as u32 + 1,
                total,
            });
        }

        if has_native_text {
            return Ok(ExtractionOutcome::Text(ExtractedDocument {
                page_count: total,
                pages,
                used_ocr: false,
            }));
        }

        warn!(path = %path.display(), "no text layer found, attempting OCR fallback");
        let pages = self.ocr_pages(&document, path, total, on_progress);
        if pages.is_empty() {
            return Ok(ExtractionOutcome::Empty {
                page_count: total,
                reason: EMPTY_DOCUMENT_REASON.to_string(),
            });
        }

        info!(path = %path.display(), pages = pages.len(), "OCR fallback recovered text");
        Ok(ExtractionOutcome::Text(ExtractedDocument {
            page_count: total,
            pages,
            used_ocr: true,
        }))
    }

    fn ocr_pages(
        &self,
        document: &Document,
        path: &Path,
        total: u32,
        on_progress: &mut dyn FnMut(ExtractionProgress),
    ) -> Vec<ExtractedPage> {
        let mut pages = Vec::new();

        for (position, (page, page_id)) in document.get_pages().into_iter().enumerate() {
            match self.images.largest_raster(document, page, page_id) {
                None => debug!(path = %path.display(), page, "page has no raster to OCR"),
                Some(raster) => match self.ocr.recognize(&raster, path) {
                    Ok(text) if !text.trim().is_empty() => pages.push(ExtractedPage {
                        page,
                        markdown: text.trim().to_string(),
                        image_count: 0,
                    }),
                    Ok(_) => debug!(path = %path.display(), page, "OCR returned no text"),
                    Err(error) => {
                        warn!(path = %path.display(), page, %error, "OCR failed for page")
                    }
                },
            }

            on_progress(ExtractionProgress::Ocr {
                current: position as u32 + 1,
                total,
            });
        }

        pages
    }
}
