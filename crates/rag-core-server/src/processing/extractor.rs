//! Content extraction: map a document path to cleaned text plus structural
//! metadata, with a quality verdict the pipeline gates on.

use once_cell::sync::Lazy;
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use regex::Regex;
use std::path::Path;
use tracing::{error, info, warn};

use crate::models::extraction::{
    CodeBlockMeta, ContentType, ExtractedContent, ExtractionMetadata, ImageMeta, LinkMeta,
    ListMeta, TableMeta,
};
use crate::utils::error::AnalysisError;

/// Sealed dispatch by file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Plain,
    Markdown,
    Code,
    Pdf,
    Docx,
    Generic,
}

const CODE_LANGUAGES: &[(&str, &str)] = &[
    ("py", "python"),
    ("js", "javascript"),
    ("ts", "typescript"),
    ("java", "java"),
    ("cpp", "cpp"),
    ("c", "c"),
    ("cs", "csharp"),
    ("php", "php"),
    ("rb", "ruby"),
    ("go", "go"),
    ("rs", "rust"),
    ("swift", "swift"),
];

// Formats with no text extraction path at all. These fail fast instead of
// running the generic fallback over binary bytes.
const BINARY_SUFFIXES: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "zip", "gz", "tar", "7z", "rar",
    "exe", "dll", "so", "dylib", "bin", "class", "o", "a", "mp3", "wav", "flac", "mp4",
    "avi", "mkv", "mov", "iso",
];

impl DocumentKind {
    pub fn from_path(path: &Path) -> Self {
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match suffix.as_str() {
            "txt" | "text" => Self::Plain,
            "md" | "markdown" | "mdown" => Self::Markdown,
            "pdf" => Self::Pdf,
            "docx" | "doc" => Self::Docx,
            other if CODE_LANGUAGES.iter().any(|(ext, _)| *ext == other) => Self::Code,
            _ => Self::Generic,
        }
    }

    /// Parallelism bound for this kind inside a pipeline batch.
    pub fn concurrent_limit(&self) -> usize {
        match self {
            Self::Pdf | Self::Docx => 2,
            Self::Code => 4,
            _ => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Markdown => "markdown",
            Self::Code => "code",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Generic => "generic",
        }
    }
}

static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n").unwrap());
static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static UPPER_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.?\s+[A-Z]").unwrap());

pub struct ContentExtractor;

impl ContentExtractor {
    /// Extract a document. Missing or unreadable files and formats with
    /// no extraction path are hard errors; format-level parse failures
    /// degrade to a quality-0 result instead.
    pub fn extract(path: &Path) -> Result<ExtractedContent, AnalysisError> {
        if !path.exists() {
            return Err(AnalysisError::FileAccess(format!(
                "file not found: {}",
                path.display()
            )));
        }

        let kind = DocumentKind::from_path(path);

        // only suffixes no dedicated extractor claims can be unsupported;
        // the MIME table alone must not veto e.g. ".ts" (video/mp2t)
        if kind == DocumentKind::Generic {
            if let Some(format) = Self::unsupported_format(path) {
                return Err(AnalysisError::UnsupportedKind(format!(
                    "{}: {}",
                    format,
                    path.display()
                )));
            }
        }

        info!("Extracting {} as {}", path.display(), kind.as_str());

        let mut result = match kind {
            DocumentKind::Plain => Self::extract_plain(path)?,
            DocumentKind::Markdown => Self::extract_markdown(path)?,
            DocumentKind::Code => Self::extract_code(path)?,
            DocumentKind::Pdf => Self::extract_pdf(path),
            DocumentKind::Docx => Self::extract_docx(path),
            DocumentKind::Generic => Self::extract_generic(path)?,
        };

        Self::add_file_metadata(&mut result, path);
        Ok(result)
    }

    /// A format no extractor can attempt: known binary suffixes, plus
    /// anything the MIME table identifies as image, audio or video.
    fn unsupported_format(path: &Path) -> Option<String> {
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        if BINARY_SUFFIXES.contains(&suffix.as_str()) {
            return Some(suffix);
        }

        if let Some(mime) = mime_guess::from_path(path).first() {
            let top = mime.type_();
            if top == mime_guess::mime::IMAGE
                || top == mime_guess::mime::AUDIO
                || top == mime_guess::mime::VIDEO
            {
                return Some(mime.to_string());
            }
        }

        None
    }

    /// Decode bytes trying UTF-8, then Latin-1, then CP-1252.
    fn decode(bytes: &[u8]) -> Result<String, AnalysisError> {
        if let Ok(text) = std::str::from_utf8(bytes) {
            if !text.is_empty() {
                return Ok(text.to_string());
            }
        }

        let latin1 = encoding_rs::mem::decode_latin1(bytes);
        if !latin1.is_empty() {
            return Ok(latin1.into_owned());
        }

        let (cp1252, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
        if !cp1252.is_empty() {
            return Ok(cp1252.into_owned());
        }

        Err(AnalysisError::DecodeFailed(
            "no supported encoding produced text".to_string(),
        ))
    }

    fn read_text(path: &Path) -> Result<String, AnalysisError> {
        let bytes = std::fs::read(path)
            .map_err(|e| AnalysisError::FileAccess(format!("{}: {}", path.display(), e)))?;
        if bytes.is_empty() {
            return Ok(String::new());
        }
        Self::decode(&bytes)
    }

    /// Collapse runs of blank lines and inline whitespace, trim the edges.
    fn clean_text(content: &str) -> String {
        let collapsed = BLANK_RUNS.replace_all(content, "\n\n");
        let collapsed = SPACE_RUNS.replace_all(&collapsed, " ");
        collapsed.trim().to_string()
    }

    /// Structure-preserving variant: only blank-line runs are collapsed.
    fn clean_structured(content: &str) -> String {
        BLANK_RUNS.replace_all(content, "\n\n").trim().to_string()
    }

    fn extract_plain(path: &Path) -> Result<ExtractedContent, AnalysisError> {
        let content = match Self::read_text(path) {
            Ok(content) => content,
            Err(AnalysisError::DecodeFailed(note)) => {
                return Ok(ExtractedContent::failed(format!("Extraction failed: {note}")))
            }
            Err(e) => return Err(e),
        };

        let cleaned = Self::clean_text(&content);
        let mut metadata = ExtractionMetadata::default();

        let word_count = content.split_whitespace().count();
        metadata.estimated_reading_time_minutes = (word_count / 200).max(1);

        for line in content.lines() {
            let stripped = line.trim();
            if !stripped.is_empty()
                && (stripped.chars().all(|c| !c.is_lowercase()) && stripped.len() > 3
                    || UPPER_HEADER.is_match(stripped))
            {
                metadata.headers.push(stripped.to_string());
            }
        }

        let sentences: Vec<&str> = content
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !sentences.is_empty() {
            let avg_len = sentences
                .iter()
                .map(|s| s.split_whitespace().count())
                .sum::<usize>() as f32
                / sentences.len() as f32;
            metadata.readability_score = (1.0 - (avg_len - 15.0) / 50.0).clamp(0.1, 1.0);
        }

        metadata.content_type = ContentType::Text;

        Ok(ExtractedContent {
            raw_content: content,
            cleaned_content: cleaned,
            metadata,
            extraction_quality: 1.0,
            processing_notes: vec!["Extracted plain text content".to_string()],
        })
    }

    fn extract_markdown(path: &Path) -> Result<ExtractedContent, AnalysisError> {
        let content = match Self::read_text(path) {
            Ok(content) => content,
            Err(AnalysisError::DecodeFailed(note)) => {
                return Ok(ExtractedContent::failed(format!("Extraction failed: {note}")))
            }
            Err(e) => return Err(e),
        };

        let cleaned = Self::clean_structured(&content);
        let mut metadata = Self::markdown_metadata(&content);

        let word_count = content.split_whitespace().count();
        metadata.estimated_reading_time_minutes = (word_count / 200).max(1);

        let structural = metadata.structural_element_count();
        if !content.is_empty() {
            metadata.structure_score =
                (structural as f32 / (content.len() as f32 / 1000.0)).min(1.0);
        }
        metadata.content_type = if structural > 3 {
            ContentType::Structured
        } else {
            ContentType::Text
        };

        Ok(ExtractedContent {
            raw_content: content,
            cleaned_content: cleaned,
            metadata,
            extraction_quality: 1.0,
            processing_notes: vec!["Extracted Markdown content with structure preserved".to_string()],
        })
    }

    /// Walk the Markdown event stream collecting structure.
    fn markdown_metadata(content: &str) -> ExtractionMetadata {
        let mut metadata = ExtractionMetadata::default();

        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        let parser = Parser::new_ext(content, options);

        let mut heading_text: Option<String> = None;
        let mut first_h1: Option<String> = None;
        let mut in_h1 = false;
        let mut code_lang: Option<String> = None;
        let mut code_body = String::new();
        let mut in_code = false;
        let mut link_url: Option<String> = None;
        let mut link_text = String::new();
        let mut image_url: Option<String> = None;
        let mut image_alt = String::new();
        let mut list_items: Vec<String> = Vec::new();
        let mut item_text: Option<String> = None;
        let mut list_ordered = false;
        let mut table_cells: Vec<String> = Vec::new();
        let mut table_rows: Vec<Vec<String>> = Vec::new();
        let mut table_headers: Vec<String> = Vec::new();
        let mut in_table_head = false;
        let mut cell_text: Option<String> = None;

        for event in parser {
            match event {
                Event::Start(Tag::Heading { level, .. }) => {
                    heading_text = Some(String::new());
                    in_h1 = level == pulldown_cmark::HeadingLevel::H1;
                }
                Event::End(TagEnd::Heading(_)) => {
                    if let Some(text) = heading_text.take() {
                        let text = text.trim().to_string();
                        if !text.is_empty() {
                            if in_h1 && first_h1.is_none() {
                                first_h1 = Some(text.clone());
                            }
                            metadata.headers.push(text);
                        }
                    }
                    in_h1 = false;
                }
                Event::Start(Tag::CodeBlock(kind)) => {
                    in_code = true;
                    code_body.clear();
                    code_lang = match kind {
                        CodeBlockKind::Fenced(lang) if !lang.is_empty() => {
                            Some(lang.to_string())
                        }
                        _ => None,
                    };
                }
                Event::End(TagEnd::CodeBlock) => {
                    metadata.code_blocks.push(CodeBlockMeta {
                        language: code_lang.take().unwrap_or_else(|| "text".to_string()),
                        content: code_body.trim().to_string(),
                    });
                    in_code = false;
                }
                Event::Start(Tag::Link { dest_url, .. }) => {
                    link_url = Some(dest_url.to_string());
                    link_text.clear();
                }
                Event::End(TagEnd::Link) => {
                    if let Some(url) = link_url.take() {
                        metadata.links.push(LinkMeta {
                            text: link_text.trim().to_string(),
                            url,
                        });
                    }
                }
                Event::Start(Tag::Image { dest_url, .. }) => {
                    image_url = Some(dest_url.to_string());
                    image_alt.clear();
                }
                Event::End(TagEnd::Image) => {
                    if let Some(url) = image_url.take() {
                        metadata.images.push(ImageMeta {
                            alt_text: image_alt.trim().to_string(),
                            url,
                        });
                    }
                }
                Event::Start(Tag::List(start)) => {
                    list_ordered = start.is_some();
                    list_items.clear();
                }
                Event::End(TagEnd::List(_)) => {
                    if !list_items.is_empty() {
                        metadata.lists.push(ListMeta {
                            ordered: list_ordered,
                            items: std::mem::take(&mut list_items),
                        });
                    }
                }
                Event::Start(Tag::Item) => item_text = Some(String::new()),
                Event::End(TagEnd::Item) => {
                    if let Some(text) = item_text.take() {
                        let text = text.trim().to_string();
                        if !text.is_empty() {
                            list_items.push(text);
                        }
                    }
                }
                Event::Start(Tag::Table(_)) => {
                    table_headers.clear();
                    table_rows.clear();
                }
                Event::End(TagEnd::Table) => {
                    if !table_headers.is_empty() && !table_rows.is_empty() {
                        metadata.tables.push(TableMeta {
                            headers: std::mem::take(&mut table_headers),
                            rows: std::mem::take(&mut table_rows),
                        });
                    }
                }
                Event::Start(Tag::TableHead) => in_table_head = true,
                Event::End(TagEnd::TableHead) => {
                    table_headers = std::mem::take(&mut table_cells);
                    in_table_head = false;
                }
                Event::Start(Tag::TableRow) => table_cells.clear(),
                Event::End(TagEnd::TableRow) => {
                    if !in_table_head {
                        table_rows.push(std::mem::take(&mut table_cells));
                    }
                }
                Event::Start(Tag::TableCell) => cell_text = Some(String::new()),
                Event::End(TagEnd::TableCell) => {
                    if let Some(text) = cell_text.take() {
                        table_cells.push(text.trim().to_string());
                    }
                }
                Event::Text(text) | Event::Code(text) => {
                    if in_code {
                        code_body.push_str(&text);
                    } else if let Some(cell) = cell_text.as_mut() {
                        cell.push_str(&text);
                    } else if let Some(heading) = heading_text.as_mut() {
                        heading.push_str(&text);
                    } else if let Some(item) = item_text.as_mut() {
                        item.push_str(&text);
                    }

                    if link_url.is_some() {
                        link_text.push_str(&text);
                    }
                    if image_url.is_some() {
                        image_alt.push_str(&text);
                    }
                }
                _ => {}
            }
        }

        metadata.title = first_h1;
        metadata
    }

    fn extract_code(path: &Path) -> Result<ExtractedContent, AnalysisError> {
        let content = match Self::read_text(path) {
            Ok(content) => content,
            Err(AnalysisError::DecodeFailed(note)) => {
                return Ok(ExtractedContent::failed(format!("Extraction failed: {note}")))
            }
            Err(e) => return Err(e),
        };

        let cleaned = Self::clean_structured(&content);
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let mut metadata = ExtractionMetadata::default();
        metadata.language = CODE_LANGUAGES
            .iter()
            .find(|(ext, _)| *ext == suffix)
            .map(|(_, lang)| lang.to_string());

        Self::harvest_code_structure(&content, &suffix, &mut metadata);

        let function_count = metadata
            .headers
            .iter()
            .filter(|h| h.starts_with("function:"))
            .count();
        let class_count = metadata
            .headers
            .iter()
            .filter(|h| h.starts_with("class:"))
            .count();
        let lines_of_code = content
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .count();
        if lines_of_code > 0 {
            metadata.structure_score = ((function_count + class_count * 2) as f32
                / (lines_of_code as f32 / 50.0))
                .min(1.0);
        }

        let word_count = content.split_whitespace().count();
        metadata.estimated_reading_time_minutes = (word_count / 100).max(1);
        metadata.content_type = ContentType::Code;

        Ok(ExtractedContent {
            raw_content: content,
            cleaned_content: cleaned,
            metadata,
            extraction_quality: 1.0,
            processing_notes: vec!["Extracted code content with syntax preserved".to_string()],
        })
    }

    fn harvest_code_structure(content: &str, suffix: &str, metadata: &mut ExtractionMetadata) {
        static PY_FN: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)^(?:async\s+)?def\s+(\w+)\s*\(").unwrap());
        static PY_CLASS: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)^class\s+(\w+)").unwrap());
        static PY_IMPORT: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)^(?:from\s+\S+\s+)?import\s+(.+)").unwrap());
        static JS_FN: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?m)^(?:export\s+)?(?:function\s+(\w+)|(?:const|let|var)\s+(\w+)\s*=)")
                .unwrap()
        });
        static JS_IMPORT: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#"import\s+.*?\s+from\s+['"]([^'"]+)['"]"#).unwrap());
        static RS_FN: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)^\s*(?:pub\s+)?(?:async\s+)?fn\s+(\w+)").unwrap());
        static RS_TYPE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?m)^\s*(?:pub\s+)?(?:struct|enum|trait)\s+(\w+)").unwrap());
        static GENERIC_FN: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?m)^\s*(?:public|private|protected|static|func)\s+[\w<>\[\]]*\s*(\w+)\s*\(")
                .unwrap()
        });

        match suffix {
            "py" => {
                for cap in PY_FN.captures_iter(content) {
                    metadata.headers.push(format!("function: {}", &cap[1]));
                }
                for cap in PY_CLASS.captures_iter(content) {
                    metadata.headers.push(format!("class: {}", &cap[1]));
                }
                for cap in PY_IMPORT.captures_iter(content) {
                    metadata.keywords.push(cap[1].trim().to_string());
                }
            }
            "js" | "ts" => {
                for cap in JS_FN.captures_iter(content) {
                    let name = cap.get(1).or_else(|| cap.get(2));
                    if let Some(name) = name {
                        metadata.headers.push(format!("function: {}", name.as_str()));
                    }
                }
                for cap in JS_IMPORT.captures_iter(content) {
                    metadata.keywords.push(cap[1].to_string());
                }
            }
            "rs" => {
                for cap in RS_FN.captures_iter(content) {
                    metadata.headers.push(format!("function: {}", &cap[1]));
                }
                for cap in RS_TYPE.captures_iter(content) {
                    metadata.headers.push(format!("class: {}", &cap[1]));
                }
            }
            _ => {
                for cap in GENERIC_FN.captures_iter(content) {
                    metadata.headers.push(format!("function: {}", &cap[1]));
                }
            }
        }
    }

    fn extract_pdf(path: &Path) -> ExtractedContent {
        use lopdf::Document;

        let doc = match Document::load(path) {
            Ok(doc) => doc,
            Err(e) => {
                error!("Failed to parse PDF {}: {}", path.display(), e);
                return ExtractedContent::failed(format!("PDF parse failed: {e}"));
            }
        };

        let page_count = doc.get_pages().len();
        let mut content = String::new();
        for page_num in 1..=page_count {
            if let Ok(text) = doc.extract_text(&[page_num as u32]) {
                content.push_str(&text);
                content.push('\n');
            }
        }

        if content.trim().is_empty() {
            return ExtractedContent::failed("PDF contained no extractable text".to_string());
        }

        let cleaned = Self::clean_text(&content);
        let mut metadata = ExtractionMetadata::default();
        metadata.estimated_reading_time_minutes =
            (content.split_whitespace().count() / 200).max(1);

        ExtractedContent {
            raw_content: content,
            cleaned_content: cleaned,
            metadata,
            extraction_quality: 1.0,
            processing_notes: vec![format!("Extracted {} PDF pages", page_count)],
        }
    }

    fn extract_docx(path: &Path) -> ExtractedContent {
        use docx_rs::{read_docx, DocumentChild, ParagraphChild, RunChild};

        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => return ExtractedContent::failed(format!("Read failed: {e}")),
        };

        let docx = match read_docx(&data) {
            Ok(docx) => docx,
            Err(e) => {
                error!("Failed to parse DOCX {}: {}", path.display(), e);
                return ExtractedContent::failed(format!("DOCX parse failed: {e}"));
            }
        };

        let mut content = String::new();
        for child in docx.document.children {
            if let DocumentChild::Paragraph(para) = child {
                for child in para.children {
                    if let ParagraphChild::Run(run) = child {
                        for child in run.children {
                            if let RunChild::Text(text) = child {
                                content.push_str(&text.text);
                            }
                        }
                    }
                }
                content.push('\n');
            }
        }

        if content.trim().is_empty() {
            return ExtractedContent::failed("DOCX contained no extractable text".to_string());
        }

        let cleaned = Self::clean_text(&content);
        let mut metadata = ExtractionMetadata::default();
        metadata.estimated_reading_time_minutes =
            (content.split_whitespace().count() / 200).max(1);

        ExtractedContent {
            raw_content: content,
            cleaned_content: cleaned,
            metadata,
            extraction_quality: 1.0,
            processing_notes: vec!["Extracted Word document paragraphs".to_string()],
        }
    }

    /// Fallback path for unknown suffixes: multi-encoding text read at
    /// reduced quality.
    fn extract_generic(path: &Path) -> Result<ExtractedContent, AnalysisError> {
        warn!(
            "No specific extractor for {}, using generic text extraction",
            path.display()
        );

        let content = match Self::read_text(path) {
            Ok(content) => content,
            Err(AnalysisError::DecodeFailed(note)) => {
                return Ok(ExtractedContent::failed(format!(
                    "All extraction methods failed: {note}"
                )))
            }
            Err(e) => return Err(e),
        };

        let cleaned = Self::clean_structured(&content);
        let mut metadata = ExtractionMetadata::default();
        metadata.estimated_reading_time_minutes =
            (content.split_whitespace().count() / 200).max(1);

        Ok(ExtractedContent {
            raw_content: content,
            cleaned_content: cleaned,
            metadata,
            extraction_quality: 0.7,
            processing_notes: vec!["Used generic text extraction as fallback".to_string()],
        })
    }

    fn add_file_metadata(result: &mut ExtractedContent, path: &Path) {
        if result.metadata.title.is_none() {
            result.metadata.title = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.to_string());
        }

        if let Some(mime) = mime_guess::from_path(path).first() {
            result.processing_notes.push(format!("MIME type: {mime}"));
        }

        if let Ok(meta) = std::fs::metadata(path) {
            result
                .processing_notes
                .push(format!("File size: {} bytes", meta.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn missing_file_is_a_file_access_error() {
        let result = ContentExtractor::extract(Path::new("/nonexistent/file.txt"));
        assert!(matches!(result, Err(AnalysisError::FileAccess(_))));
    }

    #[test]
    fn plain_text_is_cleaned_and_scored() {
        let path = write_temp(
            "note.txt",
            b"First   paragraph.\n\n\n\nSecond\tparagraph here.\n",
        );
        let result = ContentExtractor::extract(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(result.extraction_quality, 1.0);
        assert_eq!(
            result.cleaned_content,
            "First paragraph.\n\nSecond paragraph here."
        );
        assert!(result.metadata.estimated_reading_time_minutes >= 1);
    }

    #[test]
    fn quality_zero_implies_empty_cleaned_content() {
        let result = ExtractedContent::failed("whatever");
        assert_eq!(result.extraction_quality, 0.0);
        assert!(result.cleaned_content.is_empty());
    }

    #[test]
    fn markdown_structure_is_harvested() {
        let md = "# Title\n\nSome intro text.\n\n## Section A\n\n- item one\n- item two\n\n```rust\nfn main() {}\n```\n\n[link](https://example.com)\n";
        let path = write_temp("doc.md", md.as_bytes());
        let result = ContentExtractor::extract(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(result.metadata.title.as_deref(), Some("Title"));
        assert_eq!(result.metadata.headers, vec!["Title", "Section A"]);
        assert_eq!(result.metadata.code_blocks.len(), 1);
        assert_eq!(result.metadata.code_blocks[0].language, "rust");
        assert_eq!(result.metadata.links.len(), 1);
        assert_eq!(result.metadata.lists.len(), 1);
        assert_eq!(result.metadata.lists[0].items.len(), 2);
    }

    #[test]
    fn code_file_structure_and_language_are_detected() {
        let py = "import os\n\nclass Widget:\n    pass\n\ndef build():\n    return Widget()\n\nasync def run():\n    pass\n";
        let path = write_temp("tool.py", py.as_bytes());
        let result = ContentExtractor::extract(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(result.metadata.language.as_deref(), Some("python"));
        assert!(result
            .metadata
            .headers
            .contains(&"function: build".to_string()));
        assert!(result
            .metadata
            .headers
            .contains(&"class: Widget".to_string()));
        assert!(result.metadata.keywords.contains(&"os".to_string()));
        assert_eq!(result.metadata.content_type, ContentType::Code);
    }

    #[test]
    fn latin1_bytes_fall_back_from_utf8() {
        // 0xE9 is 'é' in Latin-1 and invalid as a standalone UTF-8 byte
        let path = write_temp("legacy.txt", b"caf\xE9 time");
        let result = ContentExtractor::extract(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(result.cleaned_content.contains("café"));
        assert_eq!(result.extraction_quality, 1.0);
    }

    #[test]
    fn unknown_suffix_uses_generic_fallback_quality() {
        let path = write_temp("data.xyz", b"some opaque text content");
        let result = ContentExtractor::extract(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(result.extraction_quality, 0.7);
    }

    #[test]
    fn binary_formats_are_rejected_as_unsupported() {
        // PNG magic bytes: no extractor should even attempt this
        let image = write_temp("photo.png", b"\x89PNG\r\n\x1a\n....");
        let result = ContentExtractor::extract(&image);
        std::fs::remove_file(&image).ok();
        assert!(matches!(result, Err(AnalysisError::UnsupportedKind(_))));

        let archive = write_temp("bundle.zip", b"PK\x03\x04....");
        let result = ContentExtractor::extract(&archive);
        std::fs::remove_file(&archive).ok();
        assert!(matches!(result, Err(AnalysisError::UnsupportedKind(_))));
    }

    #[test]
    fn kind_dispatch_covers_code_suffixes() {
        assert_eq!(
            DocumentKind::from_path(Path::new("a.rs")),
            DocumentKind::Code
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("a.md")),
            DocumentKind::Markdown
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("a.pdf")),
            DocumentKind::Pdf
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("a.unknown")),
            DocumentKind::Generic
        );
    }
}
