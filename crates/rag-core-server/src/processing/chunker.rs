//! Smart chunking with bounded token sizes, semantic boundaries and
//! overlap.
//!
//! Every strategy reduces to picking cut offsets into the cleaned text, so
//! the chunks always partition the input exactly: concatenating chunk
//! ranges reproduces the document. The overlap pass then prepends the tail
//! of the previous chunk without touching the recorded ranges.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::models::chunk::{ChunkKind, DocumentChunk};
use crate::utils::token_estimator::{count_tokens, tail_offset, token_offsets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    Adaptive,
    Fixed,
    Semantic,
    Hybrid,
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Adaptive
    }
}

impl ChunkingStrategy {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "fixed" => Self::Fixed,
            "semantic" => Self::Semantic,
            "hybrid" => Self::Hybrid,
            _ => Self::Adaptive,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkProfile {
    pub target_tokens: usize,
    pub overlap_ratio: f32,
}

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());
static SECTION_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static CODE_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?:pub\s+)?(?:async\s+)?(?:def|class|function|fn|func|impl|const|let|var)\s+\w+")
        .unwrap()
});
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*[-*+]\s+").unwrap());
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\|.*\|$").unwrap());
static FENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^```\s*$").unwrap());

/// Candidate cut position with the kind of boundary it sits on.
#[derive(Debug, Clone, Copy)]
struct Boundary {
    offset: usize,
    kind: ChunkKind,
}

pub struct SmartChunker;

impl SmartChunker {
    /// Per-suffix profile: target token size and overlap ratio.
    pub fn profile_for(path: &Path) -> ChunkProfile {
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match suffix.as_str() {
            "txt" | "text" => ChunkProfile {
                target_tokens: 512,
                overlap_ratio: 0.15,
            },
            "md" | "markdown" => ChunkProfile {
                target_tokens: 512,
                overlap_ratio: 0.20,
            },
            "pdf" | "docx" | "doc" => ChunkProfile {
                target_tokens: 768,
                overlap_ratio: 0.15,
            },
            "py" | "js" | "ts" | "java" | "cpp" | "c" | "cs" | "php" | "rb" | "go" | "rs"
            | "swift" => ChunkProfile {
                target_tokens: 1024,
                overlap_ratio: 0.10,
            },
            _ => ChunkProfile {
                target_tokens: 512,
                overlap_ratio: 0.20,
            },
        }
    }

    /// Chunk a document. Deterministic: identical input yields identical
    /// chunks. Empty input yields an empty sequence.
    pub fn chunk_document(
        content: &str,
        document_path: &Path,
        strategy: ChunkingStrategy,
        profile: Option<ChunkProfile>,
    ) -> Vec<DocumentChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let profile = profile.unwrap_or_else(|| Self::profile_for(document_path));
        debug!(
            "Chunking {} with {:?}, target {} tokens, overlap {:.0}%",
            document_path.display(),
            strategy,
            profile.target_tokens,
            profile.overlap_ratio * 100.0
        );

        let mut chunks = match strategy {
            ChunkingStrategy::Fixed => Self::fixed_chunks(content, profile.target_tokens),
            ChunkingStrategy::Semantic => Self::semantic_chunks(content, profile.target_tokens),
            ChunkingStrategy::Adaptive => {
                Self::adaptive_chunks(content, document_path, profile.target_tokens)
            }
            ChunkingStrategy::Hybrid => {
                Self::hybrid_chunks(content, document_path, profile.target_tokens)
            }
        };

        Self::apply_overlap(&mut chunks, profile.overlap_ratio);
        Self::score_boundaries(&mut chunks, content);

        debug!("Created {} chunks", chunks.len());
        chunks
    }

    // ------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------

    fn fixed_chunks(content: &str, target: usize) -> Vec<DocumentChunk> {
        let offsets = token_offsets(content);
        if offsets.is_empty() {
            return Vec::new();
        }

        let mut cuts = Vec::new();
        let mut i = target;
        while i < offsets.len() {
            cuts.push(Boundary {
                offset: offsets[i],
                kind: ChunkKind::Fixed,
            });
            i += target;
        }

        Self::materialize(content, &cuts, ChunkKind::Fixed, target, false)
    }

    /// Cut at the nearest semantic boundary, scanned in position order,
    /// never mid-boundary. A single boundary-free span larger than the
    /// target stays whole here; Hybrid re-splits those.
    fn semantic_chunks(content: &str, target: usize) -> Vec<DocumentChunk> {
        let boundaries = Self::semantic_boundaries(content);
        let cuts = Self::accumulate(content, &boundaries, target);
        Self::materialize(content, &cuts, ChunkKind::Text, target, false)
    }

    fn adaptive_chunks(content: &str, path: &Path, target: usize) -> Vec<DocumentChunk> {
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let (boundaries, default_kind) = match suffix.as_str() {
            "py" | "js" | "ts" | "java" | "cpp" | "c" | "cs" | "php" | "rb" | "go" | "rs"
            | "swift" => (
                CODE_BOUNDARY
                    .find_iter(content)
                    .map(|m| Boundary {
                        offset: m.start(),
                        kind: ChunkKind::CodeBlock,
                    })
                    .collect::<Vec<_>>(),
                ChunkKind::CodeBlock,
            ),
            "md" | "markdown" => (
                SECTION_HEADER
                    .find_iter(content)
                    .map(|m| Boundary {
                        offset: m.start(),
                        kind: ChunkKind::Section,
                    })
                    .collect(),
                ChunkKind::Section,
            ),
            _ => (
                PARAGRAPH_BREAK
                    .find_iter(content)
                    .map(|m| Boundary {
                        offset: m.end(),
                        kind: ChunkKind::Paragraph,
                    })
                    .collect(),
                ChunkKind::Paragraph,
            ),
        };

        let cuts = Self::accumulate(content, &boundaries, target);
        Self::materialize(content, &cuts, default_kind, target, true)
    }

    /// Semantic first; any chunk beyond 1.5x the target is re-split with
    /// the adaptive strategy.
    fn hybrid_chunks(content: &str, path: &Path, target: usize) -> Vec<DocumentChunk> {
        let semantic = Self::semantic_chunks(content, target);
        let tolerance = (target as f32 * 1.5) as usize;

        let mut result: Vec<DocumentChunk> = Vec::new();
        for chunk in semantic {
            if chunk.token_count > tolerance {
                let base = chunk.start_char;
                let sub = Self::adaptive_chunks(&chunk.content, path, target);
                for mut sub_chunk in sub {
                    sub_chunk.kind = sub_chunk.kind.split();
                    sub_chunk.start_char += base;
                    sub_chunk.end_char += base;
                    sub_chunk.chunk_index = result.len();
                    result.push(sub_chunk);
                }
            } else {
                let mut chunk = chunk;
                chunk.chunk_index = result.len();
                result.push(chunk);
            }
        }

        result
    }

    // ------------------------------------------------------------------
    // Shared machinery
    // ------------------------------------------------------------------

    /// All semantic boundary candidates, in position order.
    fn semantic_boundaries(content: &str) -> Vec<Boundary> {
        let mut boundaries: Vec<Boundary> = Vec::new();

        for m in PARAGRAPH_BREAK.find_iter(content) {
            boundaries.push(Boundary {
                offset: m.end(),
                kind: ChunkKind::Paragraph,
            });
        }
        for m in SECTION_HEADER.find_iter(content) {
            boundaries.push(Boundary {
                offset: m.start(),
                kind: ChunkKind::Section,
            });
        }
        for m in FENCE_END.find_iter(content) {
            boundaries.push(Boundary {
                offset: m.end(),
                kind: ChunkKind::CodeBlock,
            });
        }
        for m in LIST_ITEM.find_iter(content) {
            boundaries.push(Boundary {
                offset: m.start(),
                kind: ChunkKind::Text,
            });
        }
        for m in TABLE_ROW.find_iter(content) {
            boundaries.push(Boundary {
                offset: m.end(),
                kind: ChunkKind::Table,
            });
        }

        boundaries.sort_by_key(|b| b.offset);
        boundaries.dedup_by_key(|b| b.offset);
        boundaries
    }

    /// Walk boundaries in order, closing a chunk at the last boundary that
    /// keeps the running segment within the target. When a segment
    /// overflows without any usable earlier boundary, the cut lands on the
    /// overflowing boundary itself.
    fn accumulate(content: &str, boundaries: &[Boundary], target: usize) -> Vec<Boundary> {
        let mut cuts = Vec::new();
        let mut chunk_start = 0usize;
        let mut pending: Option<Boundary> = None;

        let end_marker = Boundary {
            offset: content.len(),
            kind: ChunkKind::Text,
        };

        for boundary in boundaries.iter().chain(std::iter::once(&end_marker)) {
            if boundary.offset <= chunk_start || boundary.offset > content.len() {
                continue;
            }

            let tokens = count_tokens(&content[chunk_start..boundary.offset]);
            if tokens <= target {
                if boundary.offset < content.len() {
                    pending = Some(*boundary);
                }
                continue;
            }

            if let Some(prev) = pending.take().filter(|p| p.offset > chunk_start) {
                cuts.push(prev);
                chunk_start = prev.offset;
                // re-evaluate the remainder against this boundary
                if boundary.offset < content.len()
                    && count_tokens(&content[chunk_start..boundary.offset]) > target
                {
                    cuts.push(*boundary);
                    chunk_start = boundary.offset;
                } else if boundary.offset < content.len() {
                    pending = Some(*boundary);
                }
            } else if boundary.offset < content.len() {
                // boundary-free oversize span, cut where we can
                cuts.push(*boundary);
                chunk_start = boundary.offset;
            }
        }

        cuts
    }

    /// Turn cut offsets into chunks covering the content exactly. With
    /// `split_oversize`, a chunk still over the target is re-split at
    /// fixed token boundaries under a `split_*` kind.
    fn materialize(
        content: &str,
        cuts: &[Boundary],
        default_kind: ChunkKind,
        target: usize,
        split_oversize: bool,
    ) -> Vec<DocumentChunk> {
        let mut chunks = Vec::new();
        let mut start = 0usize;

        let close = |start: usize, end: usize, kind: ChunkKind, chunks: &mut Vec<DocumentChunk>| {
            if end <= start {
                return;
            }
            let slice = &content[start..end];
            let tokens = count_tokens(slice);

            if split_oversize && tokens > target {
                // re-split oversized unit at fixed token boundaries
                let offsets = token_offsets(slice);
                let mut sub_start = 0usize;
                let mut i = target;
                while i < offsets.len() {
                    let sub_end = offsets[i];
                    chunks.push(DocumentChunk::new(
                        slice[sub_start..sub_end].to_string(),
                        chunks.len(),
                        start + sub_start,
                        start + sub_end,
                        count_tokens(&slice[sub_start..sub_end]),
                        kind.split(),
                    ));
                    sub_start = sub_end;
                    i += target;
                }
                chunks.push(DocumentChunk::new(
                    slice[sub_start..].to_string(),
                    chunks.len(),
                    start + sub_start,
                    end,
                    count_tokens(&slice[sub_start..]),
                    kind.split(),
                ));
            } else {
                chunks.push(DocumentChunk::new(
                    slice.to_string(),
                    chunks.len(),
                    start,
                    end,
                    tokens,
                    kind,
                ));
            }
        };

        for cut in cuts {
            close(start, cut.offset, cut.kind, &mut chunks);
            start = cut.offset;
        }
        close(start, content.len(), default_kind, &mut chunks);

        chunks
    }

    /// Prepend the last `floor(tokens(prev) * ratio)` tokens of each
    /// chunk's predecessor. Overlap is counted in the new chunk's tokens
    /// only; recorded ranges stay untouched.
    fn apply_overlap(chunks: &mut [DocumentChunk], ratio: f32) {
        if chunks.len() <= 1 || ratio <= 0.0 {
            return;
        }

        for i in 1..chunks.len() {
            let overlap_tokens = (chunks[i - 1].token_count as f32 * ratio) as usize;
            if overlap_tokens == 0 {
                continue;
            }

            let prev_content = &chunks[i - 1].content;
            let tail_start = tail_offset(prev_content, overlap_tokens);
            let overlap_content = prev_content[tail_start..].to_string();
            if overlap_content.is_empty() {
                continue;
            }

            let overlap_len = overlap_content.len();
            let combined = format!("{}\n{}", overlap_content, chunks[i].content);
            chunks[i].token_count = count_tokens(&combined);
            chunks[i].content = combined;
            chunks[i].overlap_with_previous = overlap_len;
            chunks[i - 1].overlap_with_next = overlap_len;
        }
    }

    /// Boundary-quality heuristic: 1.0 at a paragraph break or document
    /// end, 0.8 at a single newline, 0.6 otherwise.
    fn score_boundaries(chunks: &mut [DocumentChunk], content: &str) {
        static SOFT_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\n\s*\n").unwrap());

        for chunk in chunks.iter_mut() {
            if chunk.end_char >= content.len() {
                chunk.semantic_score = 1.0;
                continue;
            }

            let following = &content[chunk.end_char..content.len().min(chunk.end_char + 4)];
            chunk.semantic_score = if SOFT_BREAK.is_match(following) {
                1.0
            } else if following.starts_with('\n') {
                0.8
            } else {
                // the chunk may carry its trailing separator itself
                let own_tail: String = chunk
                    .content
                    .chars()
                    .rev()
                    .take(4)
                    .collect::<String>()
                    .chars()
                    .rev()
                    .collect();
                if own_tail.contains("\n\n") {
                    1.0
                } else if own_tail.ends_with('\n') {
                    0.8
                } else {
                    0.6
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md_path() -> &'static Path {
        Path::new("doc.md")
    }

    fn txt_path() -> &'static Path {
        Path::new("doc.txt")
    }

    fn reassemble(chunks: &[DocumentChunk], content: &str) -> String {
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&content[chunk.start_char..chunk.end_char]);
        }
        out
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunks =
            SmartChunker::chunk_document("", txt_path(), ChunkingStrategy::Adaptive, None);
        assert!(chunks.is_empty());

        let chunks =
            SmartChunker::chunk_document("   \n\n  ", txt_path(), ChunkingStrategy::Fixed, None);
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "para one words here.\n\npara two words here.\n\npara three words here.";
        let a = SmartChunker::chunk_document(text, txt_path(), ChunkingStrategy::Adaptive, None);
        let b = SmartChunker::chunk_document(text, txt_path(), ChunkingStrategy::Adaptive, None);

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.content, y.content);
            assert_eq!(x.start_char, y.start_char);
            assert_eq!(x.end_char, y.end_char);
            assert_eq!(x.semantic_score, y.semantic_score);
        }
    }

    #[test]
    fn ranges_partition_the_document() {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!("paragraph {i} with several words inside it.\n\n"));
        }

        for strategy in [
            ChunkingStrategy::Fixed,
            ChunkingStrategy::Semantic,
            ChunkingStrategy::Adaptive,
            ChunkingStrategy::Hybrid,
        ] {
            let profile = ChunkProfile {
                target_tokens: 40,
                overlap_ratio: 0.15,
            };
            let chunks =
                SmartChunker::chunk_document(&text, txt_path(), strategy, Some(profile));
            assert!(!chunks.is_empty());
            // concatenating recorded ranges (overlap excluded) reproduces
            // the cleaned text byte for byte
            assert_eq!(reassemble(&chunks, &text), text, "strategy {strategy:?}");
            // ordinals are dense
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.chunk_index, i);
                assert!(chunk.end_char > chunk.start_char);
            }
        }
    }

    #[test]
    fn overlap_tokens_are_counted_in_the_borrowing_chunk() {
        let mut text = String::new();
        for i in 0..30 {
            text.push_str(&format!("sentence number {i} has a few words.\n\n"));
        }

        let profile = ChunkProfile {
            target_tokens: 30,
            overlap_ratio: 0.2,
        };
        let chunks = SmartChunker::chunk_document(
            &text,
            txt_path(),
            ChunkingStrategy::Adaptive,
            Some(profile),
        );

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].overlap_with_next, pair[1].overlap_with_previous);
        }
        // the second chunk's content starts with the first chunk's tail
        let tail_start = pair_tail(&chunks[0]);
        assert!(chunks[1].content.starts_with(&tail_start));
        assert!(chunks[1].overlap_with_previous <= chunks[0].content.len());
    }

    fn pair_tail(chunk: &DocumentChunk) -> String {
        chunk.content[chunk.content.len() - chunk.overlap_with_next..].to_string()
    }

    #[test]
    fn markdown_sections_are_respected() {
        // three sections of ~700, ~500, ~800 tokens against a 768 target
        let mut text = String::new();
        text.push_str("## Alpha\n\n");
        text.push_str(&"alpha word ".repeat(350));
        text.push_str("\n\n## Beta\n\n");
        text.push_str(&"beta word ".repeat(250));
        text.push_str("\n\n## Gamma\n\n");
        text.push_str(&"gamma word ".repeat(400));
        text.push('\n');

        let profile = ChunkProfile {
            target_tokens: 768,
            overlap_ratio: 0.15,
        };
        let chunks = SmartChunker::chunk_document(
            &text,
            md_path(),
            ChunkingStrategy::Adaptive,
            Some(profile),
        );

        assert!(
            (3..=4).contains(&chunks.len()),
            "expected 3-4 chunks, got {}",
            chunks.len()
        );
        for chunk in &chunks {
            assert!(
                matches!(chunk.kind, ChunkKind::Section | ChunkKind::SplitSection),
                "unexpected kind {:?}",
                chunk.kind
            );
        }
        assert_eq!(chunks.last().unwrap().semantic_score, 1.0);
    }

    #[test]
    fn fixed_strategy_bounds_every_chunk() {
        let text = "word ".repeat(1000);
        let profile = ChunkProfile {
            target_tokens: 100,
            overlap_ratio: 0.0,
        };
        let chunks = SmartChunker::chunk_document(
            &text,
            txt_path(),
            ChunkingStrategy::Fixed,
            Some(profile),
        );

        assert_eq!(chunks.len(), 10);
        for chunk in &chunks {
            assert!(chunk.token_count <= 100);
            assert_eq!(chunk.kind, ChunkKind::Fixed);
        }
    }

    #[test]
    fn hybrid_resplits_oversized_semantic_chunks() {
        // one huge paragraph with no internal boundaries
        let text = "word ".repeat(900);
        let profile = ChunkProfile {
            target_tokens: 100,
            overlap_ratio: 0.0,
        };
        let chunks = SmartChunker::chunk_document(
            &text,
            txt_path(),
            ChunkingStrategy::Hybrid,
            Some(profile),
        );

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 150, "chunk of {}", chunk.token_count);
        }
    }

    #[test]
    fn paragraph_end_scores_high() {
        let text = "first paragraph words.\n\nsecond paragraph words follow here.";
        let profile = ChunkProfile {
            target_tokens: 3,
            overlap_ratio: 0.0,
        };
        let chunks = SmartChunker::chunk_document(
            text,
            txt_path(),
            ChunkingStrategy::Adaptive,
            Some(profile),
        );

        assert!(chunks.len() >= 2);
        // last chunk ends at the document
        assert_eq!(chunks.last().unwrap().semantic_score, 1.0);
    }
}
