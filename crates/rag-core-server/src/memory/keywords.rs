//! Topic keyword extraction: stop-word-filtered top-10 terms by frequency.
//! Keywords form a multiset, so repeated terms keep their counts.

use std::collections::HashMap;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "is", "are",
    "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "may", "might", "can", "cannot", "this", "that", "these",
    "those",
];

const TOP_KEYWORDS: usize = 10;

/// Extract the top keywords of a message. Returns one entry per occurrence
/// rank, most frequent first; ties resolve alphabetically so extraction is
/// deterministic.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();

    for raw in text.split(|c: char| !c.is_alphabetic()) {
        let word = raw.to_lowercase();
        if word.len() < 3 || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        *counts.entry(word).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_KEYWORDS);
    ranked.into_iter().map(|(word, _)| word).collect()
}

/// Merge new keywords into a topic's keyword multiset, appending terms the
/// topic has not seen yet.
pub fn merge_keywords(existing: &mut Vec<String>, new_keywords: &[String]) {
    for keyword in new_keywords {
        if !existing.contains(keyword) {
            existing.push(keyword.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_ranks_keywords() {
        let text = "cache cache cache eviction eviction policy";
        let keywords = extract_keywords(text);
        assert_eq!(keywords[0], "cache");
        assert_eq!(keywords[1], "eviction");
        assert_eq!(keywords[2], "policy");
    }

    #[test]
    fn filtering_removes_noise() {
        let text = "the cache is in the system and it does work";
        let keywords = extract_keywords(text);
        assert!(keywords.contains(&"cache".to_string()));
        assert!(keywords.contains(&"system".to_string()));
        assert!(keywords.contains(&"work".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"is".to_string()));
    }

    #[test]
    fn extraction_is_deterministic() {
        let text = "alpha beta gamma alpha delta beta epsilon";
        assert_eq!(extract_keywords(text), extract_keywords(text));
    }

    #[test]
    fn at_most_ten_keywords_survive() {
        let many: String = (0..30)
            .map(|i| format!("keyword{} ", (b'a' + (i % 26)) as char).repeat(2))
            .collect();
        let keywords = extract_keywords(&many);
        assert!(keywords.len() <= 10);
    }

    #[test]
    fn merge_extends_without_duplicating() {
        let mut existing = vec!["cache".to_string(), "policy".to_string()];
        merge_keywords(
            &mut existing,
            &["policy".to_string(), "eviction".to_string()],
        );
        assert_eq!(existing, vec!["cache", "policy", "eviction"]);
    }
}
