//! Fixtures for unit tests: PDFs generated with lopdf and recording fakes.

use crate::chunking::ChunkingConfig;
use crate::config::{ImageLimits, VectorBackendKind};
use crate::embeddings::CharacterNgramEmbedder;
use crate::error::{IngestError, StoreError};
use crate::extractor::{ExtractionEngine, OcrEngine};
use crate::images::PageImage;
use crate::models::{DocumentId, FileStat, NewDocument};
use crate::pipeline::IngestionPipeline;
use crate::records::{RecordStore, SqliteRecordStore};
use crate::status::{NotificationSink, ProcessingEvent};
use crate::stores::open_index;
use crate::vector_store::VectorStore;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Answers every page with `"<prefix> <page>"`.
pub(crate) struct FixedOcr(pub &'static str);

impl OcrEngine for FixedOcr {
    fn recognize(&self, image: &PageImage, _source: &Path) -> Result<String, IngestError> {
        Ok(format!("{} {}", self.0, image.page))
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<ProcessingEvent>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<ProcessingEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

impl NotificationSink for RecordingSink {
    fn broadcast(&self, event: ProcessingEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

#[derive(Default)]
pub(crate) struct TestPdf {
    pages: Vec<(Option<String>, Vec<usize>)>,
    images: Vec<(i64, i64)>,
}

impl TestPdf {
    pub(crate) fn text_pages(pages: &[&str]) -> Self {
        let mut pdf = Self::default();
        for text in pages {
            pdf.page(Some(text), &[]);
        }
        pdf
    }

    /// Registers a JPEG XObject and returns a handle pages can reference. A handle used on
    /// several pages resolves to the same PDF object.
    pub(crate) fn jpeg(&mut self, width: i64, height: i64) -> usize {
        self.images.push((width, height));
        self.images.len() - 1
    }

    pub(crate) fn page(&mut self, text: Option<&str>, images: &[usize]) -> &mut Self {
        self.pages.push((text.map(str::to_string), images.to_vec()));
        self
    }

    pub(crate) fn build(&self) -> Document {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let font_id = document.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });

        let image_ids: Vec<ObjectId> = self
            .images
            .iter()
            .enumerate()
            .map(|(position, (width, height))| {
                let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0];
                data.extend(std::iter::repeat(position as u8).take(60));
                data.extend([0xFF, 0xD9]);
                document.add_object(Stream::new(
                    dictionary! {
                        "Type" => "XObject",
                        "Subtype" => "Image",
                        "Width" => *width,
                        "Height" => *height,
                        "ColorSpace" => "DeviceRGB",
                        "BitsPerComponent" => 8,
                        "Filter" => "DCTDecode",
                    },
                    data,
                ))
            })
            .collect();

        let mut kids = Vec::new();
        for (text, images) in &self.pages {
            let mut operations = Vec::new();
            if let Some(text) = text {
                operations.extend([
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(text.as_str())]),
                    Operation::new("ET", vec![]),
                ]);
            }

            let mut xobjects = lopdf::Dictionary::new();
            for (slot, image) in images.iter().enumerate() {
                let name = format!("Im{slot}");
                xobjects.set(name.as_bytes().to_vec(), image_ids[*image]);
                operations.extend([
                    Operation::new("q", vec![]),
                    Operation::new("Do", vec![Object::Name(name.into_bytes())]),
                    Operation::new("Q", vec![]),
                ]);
            }

            let content = Content { operations }.encode().unwrap_or_default();
            let content_id = document.add_object(Stream::new(dictionary! {}, content));
            let page_id = document.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                    "XObject" => xobjects,
                },
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);
        document
    }

    pub(crate) fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut document = self.build();
        document.save(path).map(|_| ())
    }
}

/// A pipeline over an in-memory record store, a SQLite vector index and the hashing
/// embedder, rooted in a temporary directory.
pub(crate) struct TestStack {
    pub(crate) dir: TempDir,
    pub(crate) records: Arc<dyn RecordStore>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) pipeline: Arc<IngestionPipeline>,
}

impl TestStack {
    pub(crate) fn new(ocr: Arc<dyn OcrEngine>) -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_backend(ocr, VectorBackendKind::Sqlite)
    }

    /// The vector index lives under `dir/index`.
    pub(crate) fn with_backend(
        ocr: Arc<dyn OcrEngine>,
        backend: VectorBackendKind,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open_in_memory()?);
        let chunking = ChunkingConfig::new(200, 20)?;
        let (index, _) = open_index(backend, &dir.path().join("index"))?;
        let vectors = Arc::new(VectorStore::new(
            index,
            Arc::clone(&records),
            Arc::new(CharacterNgramEmbedder::new(32)),
            chunking,
        ));
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&records),
            vectors,
            ExtractionEngine::new(ImageLimits::default(), ocr),
            chunking,
            sink.clone(),
        ));

        Ok(Self {
            dir,
            records,
            sink,
            pipeline,
        })
    }

    pub(crate) fn create_document(&self, path: &Path, filename: &str) -> Result<DocumentId, StoreError> {
        let stat = FileStat::read(path).ok();
        let document = self.records.create_document(&NewDocument {
            filename: filename.to_string(),
            file_path: path.display().to_string(),
            file_size: stat.map_or(0, |stat| stat.size),
            file_modified_at: stat.and_then(|stat| stat.modified_at),
            processing: false,
        })?;
        Ok(document.id)
    }
}
