//! Tag-similarity document selection with optional semantic augmentation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::ScoringWeights;
use crate::models::tags::{DocumentScore, TagModel};
use crate::utils::similarity::max_cosine_similarity;

const EXACT_MATCH_BOOST: f32 = 1.2;
const PARTIAL_WEIGHT: f32 = 0.3;
const CATEGORY_FACTOR: f32 = 0.5;
const SUBSTRING_FACTOR: f32 = 0.3;
const WORD_OVERLAP_FACTOR: f32 = 0.4;
const FRESHNESS_HALF_LIFE_DAYS: f64 = 30.0;

/// A candidate document with everything the selector can score on.
#[derive(Debug, Clone)]
pub struct CandidateDocument {
    pub file_path: String,
    pub tags: Vec<TagModel>,
    pub last_analyzed: Option<DateTime<Utc>>,
    pub chunk_embeddings: Vec<Vec<f32>>,
    pub structure_score: f32,
}

pub struct TagBasedSelector {
    max_documents: usize,
    weights: ScoringWeights,
}

impl TagBasedSelector {
    pub fn new(max_documents: usize, weights: ScoringWeights) -> Self {
        Self {
            max_documents,
            weights,
        }
    }

    /// Rank candidates against the target tag set and return the top
    /// paths. Empty targets select nothing; inaccessible candidates are
    /// dropped with a warning.
    pub fn select(
        &self,
        target_tags: &[TagModel],
        candidates: &[CandidateDocument],
        exclude_paths: &[String],
        query_embedding: Option<&[f32]>,
    ) -> Vec<DocumentScore> {
        if target_tags.is_empty() {
            warn!("No target tags provided for document selection");
            return Vec::new();
        }

        let target_by_name: HashMap<String, &TagModel> = target_tags
            .iter()
            .map(|tag| (tag.name.to_lowercase(), tag))
            .collect();

        let mut scored: Vec<(DocumentScore, Option<DateTime<Utc>>)> = Vec::new();

        for candidate in candidates {
            if exclude_paths.contains(&candidate.file_path) || candidate.tags.is_empty() {
                continue;
            }

            if !Path::new(&candidate.file_path).is_file() {
                warn!("Document not accessible: {}", candidate.file_path);
                continue;
            }

            let mut score = self.tag_score(&target_by_name, &candidate.tags);

            if let Some(query) = query_embedding {
                let semantic = if candidate.chunk_embeddings.is_empty() {
                    0.0
                } else {
                    max_cosine_similarity(query, &candidate.chunk_embeddings)
                };
                let freshness = candidate
                    .last_analyzed
                    .map(|t| {
                        let days = (Utc::now() - t).num_seconds() as f64 / 86_400.0;
                        (-days / FRESHNESS_HALF_LIFE_DAYS).exp() as f32
                    })
                    .unwrap_or(0.0);
                let content = candidate
                    .tags
                    .iter()
                    .map(|t| t.confidence)
                    .sum::<f32>()
                    / candidate.tags.len() as f32;

                score.total_score = self.weights.tag_similarity * score.total_score
                    + self.weights.semantic_similarity * semantic
                    + self.weights.content_relevance * content
                    + self.weights.structural_quality * candidate.structure_score
                    + self.weights.freshness * freshness;
            }

            if score.total_score > 0.0 {
                score.file_path = candidate.file_path.clone();
                scored.push((score, candidate.last_analyzed));
            }
        }

        // ties break toward the most recently analysed document
        scored.sort_by(|a, b| {
            b.0.total_score
                .partial_cmp(&a.0.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        scored.truncate(self.max_documents);

        let selected: Vec<DocumentScore> = scored.into_iter().map(|(score, _)| score).collect();
        info!(
            "Selected {} documents from {} candidates",
            selected.len(),
            candidates.len()
        );
        selected
    }

    /// Exact matches score `(c_t + c_d)/2 * 1.2`; document-only tags get
    /// the best partial credit (category, substring or word overlap),
    /// weighted down. The sum is normalized by the target tag count so
    /// tag-heavy documents are not favored.
    fn tag_score(
        &self,
        target_by_name: &HashMap<String, &TagModel>,
        doc_tags: &[TagModel],
    ) -> DocumentScore {
        let mut matching_tags = Vec::new();
        let mut tag_scores = HashMap::new();
        let mut total = 0.0f32;

        for doc_tag in doc_tags {
            let doc_name = doc_tag.name.to_lowercase();

            if let Some(target_tag) = target_by_name.get(&doc_name) {
                let tag_score =
                    (target_tag.confidence + doc_tag.confidence) / 2.0 * EXACT_MATCH_BOOST;
                matching_tags.push(doc_name.clone());
                tag_scores.insert(doc_name, tag_score);
                total += tag_score;
            } else {
                let partial = Self::partial_score(doc_tag, target_by_name);
                if partial > 0.0 {
                    tag_scores.insert(format!("partial_{doc_name}"), partial);
                    total += partial * PARTIAL_WEIGHT;
                }
            }
        }

        if !target_by_name.is_empty() {
            total /= target_by_name.len() as f32;
        }

        debug!("Tag score {:.3} across {} tags", total, doc_tags.len());

        DocumentScore {
            file_path: String::new(),
            total_score: total,
            matching_tags,
            tag_scores,
        }
    }

    /// Best partial credit of a document-only tag against any target tag.
    fn partial_score(doc_tag: &TagModel, target_by_name: &HashMap<String, &TagModel>) -> f32 {
        let doc_name = doc_tag.name.to_lowercase();
        let mut best = 0.0f32;

        for target_tag in target_by_name.values() {
            let target_name = target_tag.name.to_lowercase();
            let confidence_floor = doc_tag.confidence.min(target_tag.confidence);

            if let (Some(doc_cat), Some(target_cat)) = (&doc_tag.category, &target_tag.category) {
                if doc_cat.eq_ignore_ascii_case(target_cat) {
                    best = best.max(confidence_floor * CATEGORY_FACTOR);
                }
            }

            if doc_name.contains(&target_name) || target_name.contains(&doc_name) {
                best = best.max(confidence_floor * SUBSTRING_FACTOR);
            }

            let doc_words: Vec<&str> = doc_name.split_whitespace().collect();
            let target_words: Vec<&str> = target_name.split_whitespace().collect();
            if doc_words.len() > 1 && target_words.len() > 1 {
                let common = doc_words
                    .iter()
                    .filter(|w| target_words.contains(w))
                    .count();
                if common > 0 {
                    let overlap = common as f32 / doc_words.len().max(target_words.len()) as f32;
                    best = best.max(confidence_floor * overlap * WORD_OVERLAP_FACTOR);
                }
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn candidate(path: &str, tags: Vec<TagModel>) -> CandidateDocument {
        CandidateDocument {
            file_path: path.to_string(),
            tags,
            last_analyzed: None,
            chunk_embeddings: Vec::new(),
            structure_score: 0.5,
        }
    }

    fn write_temp(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, "content").unwrap();
        path
    }

    fn selector() -> TagBasedSelector {
        TagBasedSelector::new(5, ScoringWeights::default())
    }

    #[test]
    fn empty_target_selects_nothing() {
        let doc = candidate("a.md", vec![TagModel::new("api", 0.9)]);
        assert!(selector().select(&[], &[doc], &[], None).is_empty());
    }

    #[test]
    fn ordering_follows_tag_overlap() {
        let a_path = write_temp("a.md");
        let b_path = write_temp("b.md");
        let c_path = write_temp("c.md");

        let targets = vec![TagModel::new("api", 0.9), TagModel::new("auth", 0.8)];
        let candidates = vec![
            candidate(
                a_path.to_str().unwrap(),
                vec![TagModel::new("api", 0.95), TagModel::new("auth", 0.9)],
            ),
            candidate(b_path.to_str().unwrap(), vec![TagModel::new("api", 0.9)]),
            candidate(c_path.to_str().unwrap(), vec![TagModel::new("random", 0.6)]),
        ];

        let selected = selector().select(&targets, &candidates, &[], None);

        std::fs::remove_file(&a_path).ok();
        std::fs::remove_file(&b_path).ok();
        std::fs::remove_file(&c_path).ok();

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].file_path, a_path.to_str().unwrap());
        assert_eq!(selected[1].file_path, b_path.to_str().unwrap());
        // "random" has no overlap at all, so C is absent
        assert!(!selected.iter().any(|s| s.file_path == c_path.to_str().unwrap()));
    }

    #[test]
    fn confidence_shift_is_bounded_by_the_boost_over_target_count() {
        let path = write_temp("d.md");
        let doc = vec![TagModel::new("api", 0.9), TagModel::new("auth", 0.7)];

        let base_targets = vec![TagModel::new("api", 0.5), TagModel::new("auth", 0.6)];
        let mut shifted_targets = base_targets.clone();
        let delta = 0.3f32;
        shifted_targets[0].confidence += delta;

        let candidates = vec![candidate(path.to_str().unwrap(), doc)];
        let base = selector().select(&base_targets, &candidates, &[], None);
        let shifted = selector().select(&shifted_targets, &candidates, &[], None);
        std::fs::remove_file(&path).ok();

        let change = (shifted[0].total_score - base[0].total_score).abs();
        let bound = delta * EXACT_MATCH_BOOST / base_targets.len() as f32;
        assert!(change <= bound + 1e-6, "change {change} exceeds bound {bound}");
    }

    #[test]
    fn excluded_and_missing_candidates_are_dropped() {
        let present = write_temp("e.md");
        let targets = vec![TagModel::new("api", 0.9)];

        let candidates = vec![
            candidate(present.to_str().unwrap(), vec![TagModel::new("api", 0.9)]),
            candidate("/no/such/file.md", vec![TagModel::new("api", 0.9)]),
        ];

        // missing file is silently skipped
        let selected = selector().select(&targets, &candidates, &[], None);
        assert_eq!(selected.len(), 1);

        // and an explicit exclude drops the survivor too
        let selected = selector().select(
            &targets,
            &candidates,
            &[present.to_str().unwrap().to_string()],
            None,
        );
        std::fs::remove_file(&present).ok();
        assert!(selected.is_empty());
    }

    #[test]
    fn partial_credit_comes_from_category_substring_and_overlap() {
        let target = TagModel::new("user auth", 0.8).with_category("security");
        let mut by_name: HashMap<String, &TagModel> = HashMap::new();
        by_name.insert("user auth".to_string(), &target);

        // same category
        let by_category = TagModel::new("sessions", 0.6).with_category("security");
        let score = TagBasedSelector::partial_score(&by_category, &by_name);
        assert!((score - 0.6 * CATEGORY_FACTOR).abs() < 1e-6);

        // substring
        let by_substring = TagModel::new("auth", 0.6);
        let score = TagBasedSelector::partial_score(&by_substring, &by_name);
        assert!((score - 0.6 * SUBSTRING_FACTOR).abs() < 1e-6);

        // word overlap on multi-word tags: 1 common / 2 max words
        let by_overlap = TagModel::new("auth tokens", 0.6);
        let score = TagBasedSelector::partial_score(&by_overlap, &by_name);
        assert!((score - 0.6 * 0.5 * WORD_OVERLAP_FACTOR).abs() < 1e-6);
    }

    #[test]
    fn semantic_augmentation_blends_with_weights() {
        let path = write_temp("f.md");
        let targets = vec![TagModel::new("api", 0.9)];

        let mut with_embeddings = candidate(
            path.to_str().unwrap(),
            vec![TagModel::new("api", 0.9)],
        );
        with_embeddings.chunk_embeddings = vec![vec![1.0, 0.0]];

        let query = vec![1.0, 0.0];
        let selected = selector().select(&targets, &[with_embeddings], &[], Some(&query));
        std::fs::remove_file(&path).ok();

        assert_eq!(selected.len(), 1);
        // blended score includes the full-similarity semantic component
        let weights = ScoringWeights::default();
        let tag_only = (0.9 + 0.9) / 2.0 * EXACT_MATCH_BOOST; // normalized by 1 target
        let expected = weights.tag_similarity * tag_only
            + weights.semantic_similarity * 1.0
            + weights.content_relevance * 0.9
            + weights.structural_quality * 0.5;
        assert!((selected[0].total_score - expected).abs() < 1e-4);
    }
}
