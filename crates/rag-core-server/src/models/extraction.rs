use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Code,
    Mixed,
    Structured,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlockMeta {
    pub language: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkMeta {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMeta {
    pub alt_text: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMeta {
    pub ordered: bool,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Structural metadata harvested during extraction. Fields an extractor
/// cannot determine stay empty; nothing is guessed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub title: Option<String>,
    pub headers: Vec<String>,
    pub tables: Vec<TableMeta>,
    pub code_blocks: Vec<CodeBlockMeta>,
    pub links: Vec<LinkMeta>,
    pub images: Vec<ImageMeta>,
    pub lists: Vec<ListMeta>,
    pub keywords: Vec<String>,
    pub structure_score: f32,
    pub readability_score: f32,
    pub content_type: ContentType,
    pub language: Option<String>,
    pub estimated_reading_time_minutes: usize,
}

impl ExtractionMetadata {
    pub fn structural_element_count(&self) -> usize {
        self.headers.len() + self.code_blocks.len() + self.tables.len()
    }
}

/// Extraction output: raw bytes decoded, cleaned text, metadata, and a
/// quality verdict. Invariant: quality == 0.0 implies `cleaned_content` is
/// empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub raw_content: String,
    pub cleaned_content: String,
    pub metadata: ExtractionMetadata,
    pub extraction_quality: f32,
    pub processing_notes: Vec<String>,
}

impl ExtractedContent {
    /// Empty result for a failed extraction.
    pub fn failed(note: impl Into<String>) -> Self {
        Self {
            raw_content: String::new(),
            cleaned_content: String::new(),
            metadata: ExtractionMetadata::default(),
            extraction_quality: 0.0,
            processing_notes: vec![note.into()],
        }
    }
}
