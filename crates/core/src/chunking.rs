use crate::error::IngestError;
use crate::models::{DocumentId, PageText, RecordMetadata};
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Split preference: paragraph, line, sentence, word, then a hard character cut.
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

const INLINE_IMAGE_PATTERN: &str = r"!\[([^\]]*)\]\(data:[^)]*\)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, IngestError> {
        if chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        if chunk_overlap >= chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk overlap {chunk_overlap} must be smaller than chunk size {chunk_size}"
            )));
        }

        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            chunk_overlap: crate::config::DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    /// Byte offset of the first non-whitespace character in the source text.
    pub start: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    chars: usize,
}

pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<TextChunk> {
    let mut spans = Vec::new();
    atomize(text, 0, &SEPARATORS, config.chunk_size, &mut spans);
    merge_spans(text, &spans, config)
}

fn atomize(text: &str, base: usize, separators: &[&str], max_chars: usize, out: &mut Vec<Span>) {
    if text.is_empty() {
        return;
    }

    let chars = text.chars().count();
    if chars <= max_chars {
        out.push(Span {
            start: base,
            end: base + text.len(),
            chars,
        });
        return;
    }

    let Some(position) = separators
        .iter()
        .position(|separator| separator.is_empty() || text.contains(separator))
    else {
        hard_cut(text, base, max_chars, out);
        return;
    };

    let separator = separators[position];
    if separator.is_empty() {
        hard_cut(text, base, max_chars, out);
        return;
    }

    let mut offset = 0;
    for piece in text.split_inclusive(separator) {
        atomize(piece, base + offset, &separators[position + 1..], max_chars, out);
        offset += piece.len();
    }
}

fn hard_cut(text: &str, base: usize, max_chars: usize, out: &mut Vec<Span>) {
    let mut start = 0;
    let mut count = 0;

    for (position, _) in text.char_indices() {
        if count == max_chars {
            out.push(Span {
                start: base + start,
                end: base + position,
                chars: count,
            });
            start = position;
            count = 0;
        }
        count += 1;
    }

    if count > 0 {
        out.push(Span {
            start: base + start,
            end: base + text.len(),
            chars: count,
        });
    }
}

fn merge_spans(text: &str, spans: &[Span], config: ChunkingConfig) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut window: VecDeque<Span> = VecDeque::new();
    let mut window_chars = 0usize;

    for span in spans {
        if !window.is_empty() && window_chars + span.chars > config.chunk_size {
            push_window(text, &window, &mut chunks);

            while window_chars > config.chunk_overlap
                || (window_chars > 0 && window_chars + span.chars > config.chunk_size)
            {
                match window.pop_front() {
                    Some(dropped) => window_chars -= dropped.chars,
                    None => break,
                }
            }
        }

        window.push_back(*span);
        window_chars += span.chars;
    }

    if !window.is_empty() {
        push_window(text, &window, &mut chunks);
    }

    chunks
}

fn push_window(text: &str, window: &VecDeque<Span>, chunks: &mut Vec<TextChunk>) {
    let (Some(first), Some(last)) = (window.front(), window.back()) else {
        return;
    };

    let raw = &text[first.start..last.end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }

    let leading = raw.len() - raw.trim_start().len();
    chunks.push(TextChunk {
        index: chunks.len(),
        start: first.start + leading,
        text: trimmed.to_string(),
    });
}

/// Full document text assembled from per-page text, remembering where each page starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentText {
    pub text: String,
    page_starts: Vec<(usize, u32)>,
}

impl DocumentText {
    pub fn from_pages<'a>(pages: impl IntoIterator<Item = (u32, &'a str)>) -> Self {
        let mut document = Self::default();

        for (page, text) in pages {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            if !document.text.is_empty() {
                document.text.push_str("\n\n");
            }
            document.page_starts.push((document.text.len(), page));
            document.text.push_str(text);
        }

        document
    }

    /// Rebuilds the indexable text from persisted page markdown. Inline image data is
    /// replaced with its alt-text placeholder so base64 payloads are never embedded.
    pub fn from_markdown(pages: &[PageText]) -> Result<Self, IngestError> {
        let pattern = Regex::new(INLINE_IMAGE_PATTERN)?;
        let stripped = pages
            .iter()
            .map(|page| (page.page, replace_inline_images(&pattern, &page.markdown)))
            .collect::<Vec<_>>();

        Ok(Self::from_pages(
            stripped.iter().map(|(page, text)| (*page, text.as_str())),
        ))
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.page_starts.len()
    }

    /// Page whose text contains `offset`. Non-decreasing in `offset`.
    pub fn page_for_offset(&self, offset: usize) -> u32 {
        let position = self
            .page_starts
            .partition_point(|(start, _)| *start <= offset);

        match position {
            0 => self.page_starts.first().map_or(0, |(_, page)| *page),
            found => self.page_starts[found - 1].1,
        }
    }
}

pub fn strip_inline_images(markdown: &str) -> Result<String, IngestError> {
    let pattern = Regex::new(INLINE_IMAGE_PATTERN)?;
    Ok(replace_inline_images(&pattern, markdown))
}

fn replace_inline_images(pattern: &Regex, markdown: &str) -> String {
    pattern.replace_all(markdown, "[$1]").into_owned()
}

/// Chunk texts and the metadata the vector index stores alongside them.
#[derive(Debug, Clone, Default)]
pub struct PreparedChunks {
    pub texts: Vec<String>,
    pub metadatas: Vec<RecordMetadata>,
}

impl PreparedChunks {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn batch(&self) -> Option<&str> {
        self.metadatas.first().map(|metadata| metadata.batch.as_str())
    }
}

pub fn prepare_chunks(
    document_id: DocumentId,
    source: &str,
    document: &DocumentText,
    config: ChunkingConfig,
    batch_prefix: Option<&str>,
) -> PreparedChunks {
    let chunks = split_text(&document.text, config);
    let batch = content_batch_id(batch_prefix, &chunks);
    let timestamp = Utc::now().timestamp_millis() as f64 / 1_000.0;

    let metadatas = chunks
        .iter()
        .map(|chunk| RecordMetadata {
            document_id,
            source: source.to_string(),
            page: document.page_for_offset(chunk.start),
            batch: batch.clone(),
            index: chunk.index as u32,
            length: chunk.text.chars().count() as u32,
            timestamp,
        })
        .collect();

    PreparedChunks {
        texts: chunks.into_iter().map(|chunk| chunk.text).collect(),
        metadatas,
    }
}

/// Batch ids are a digest of the chunk texts, so the same text always maps to the same
/// record ids and re-insertion replaces instead of accumulating.
fn content_batch_id(prefix: Option<&str>, chunks: &[TextChunk]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update((chunk.text.len() as u64).to_le_bytes());
        hasher.update(chunk.text.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    let short = &digest[..8];

    match prefix {
        Some(prefix) => format!("{prefix}-{short}"),
        None => short.to_string(),
    }
}
