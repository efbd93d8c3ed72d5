use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of structural unit a chunk ends on. `Split*` variants mark
/// chunks produced by re-splitting an oversize unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Paragraph,
    Section,
    CodeBlock,
    Table,
    Fixed,
    Text,
    SplitParagraph,
    SplitSection,
    SplitCodeBlock,
    SplitText,
}

impl ChunkKind {
    /// The split counterpart of this kind.
    pub fn split(self) -> ChunkKind {
        match self {
            Self::Paragraph | Self::SplitParagraph => Self::SplitParagraph,
            Self::Section | Self::SplitSection => Self::SplitSection,
            Self::CodeBlock | Self::SplitCodeBlock => Self::SplitCodeBlock,
            _ => Self::SplitText,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Section => "section",
            Self::CodeBlock => "code_block",
            Self::Table => "table",
            Self::Fixed => "fixed",
            Self::Text => "text",
            Self::SplitParagraph => "split_paragraph",
            Self::SplitSection => "split_section",
            Self::SplitCodeBlock => "split_code_block",
            Self::SplitText => "split_text",
        }
    }
}

/// A bounded slice of a document's cleaned text.
///
/// `start_char..end_char` is the chunk's byte range in the cleaned text and
/// never includes the overlap prefix; overlap tokens are counted only in the
/// borrowing chunk's `token_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    pub chunk_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub token_count: usize,
    pub kind: ChunkKind,
    pub metadata: HashMap<String, serde_json::Value>,
    pub overlap_with_previous: usize,
    pub overlap_with_next: usize,
    pub semantic_score: f32,
}

impl DocumentChunk {
    pub fn new(
        content: String,
        chunk_index: usize,
        start_char: usize,
        end_char: usize,
        token_count: usize,
        kind: ChunkKind,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("length".to_string(), serde_json::json!(content.len()));
        metadata.insert(
            "lines".to_string(),
            serde_json::json!(content.lines().count()),
        );
        metadata.insert(
            "words".to_string(),
            serde_json::json!(content.split_whitespace().count()),
        );
        if !content.is_empty() {
            metadata.insert(
                "density".to_string(),
                serde_json::json!(token_count as f64 / content.len() as f64),
            );
        }

        Self {
            content,
            chunk_index,
            start_char,
            end_char,
            token_count,
            kind,
            metadata,
            overlap_with_previous: 0,
            overlap_with_next: 0,
            semantic_score: 1.0,
        }
    }
}

/// Summary statistics over one chunking run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkStats {
    pub total_chunks: usize,
    pub average_tokens: f64,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub average_semantic_score: f64,
    pub total_overlap_chars: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[DocumentChunk]) -> Self {
        if chunks.is_empty() {
            return Self::default();
        }

        let token_counts: Vec<usize> = chunks.iter().map(|c| c.token_count).collect();
        Self {
            total_chunks: chunks.len(),
            average_tokens: token_counts.iter().sum::<usize>() as f64 / chunks.len() as f64,
            min_tokens: *token_counts.iter().min().unwrap_or(&0),
            max_tokens: *token_counts.iter().max().unwrap_or(&0),
            average_semantic_score: chunks.iter().map(|c| c.semantic_score as f64).sum::<f64>()
                / chunks.len() as f64,
            total_overlap_chars: chunks.iter().map(|c| c.overlap_with_previous).sum(),
        }
    }
}
