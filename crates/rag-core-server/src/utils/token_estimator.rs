//! Deterministic token accounting shared by the chunker and the
//! conversation memory engine.
//!
//! A token is a Unicode word segment containing at least one alphanumeric
//! character. This keeps counting, splitting and overlap extraction exact
//! and reproducible without an external vocabulary.

use unicode_segmentation::UnicodeSegmentation;

/// Count tokens in text.
pub fn count_tokens(text: &str) -> usize {
    text.unicode_words().count()
}

/// Byte offsets of every token start, in order.
pub fn token_offsets(text: &str) -> Vec<usize> {
    text.unicode_word_indices().map(|(i, _)| i).collect()
}

/// Byte offset where the suffix holding the last `n` tokens begins.
/// Returns 0 when the text holds `n` tokens or fewer.
pub fn tail_offset(text: &str, n: usize) -> usize {
    if n == 0 {
        return text.len();
    }
    let offsets = token_offsets(text);
    if offsets.len() <= n {
        0
    } else {
        offsets[offsets.len() - n]
    }
}

/// Rough token estimate for provider payload budgeting. Slightly
/// over-counts on purpose so budgets stay safe.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count();
    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

/// Check if adding text would exceed a token limit.
pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_words_deterministically() {
        let text = "alpha beta, gamma. delta";
        assert_eq!(count_tokens(text), 4);
        assert_eq!(count_tokens(text), count_tokens(text));
    }

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(estimate_tokens(""), 0);
        assert!(token_offsets("").is_empty());
    }

    #[test]
    fn tail_offset_selects_last_tokens() {
        let text = "one two three four";
        let off = tail_offset(text, 2);
        assert_eq!(&text[off..], "three four");
        assert_eq!(tail_offset(text, 10), 0);
        assert_eq!(tail_offset(text, 0), text.len());
    }

    #[test]
    fn estimate_is_at_least_word_count() {
        let text = "word ".repeat(100);
        assert!(estimate_tokens(&text) >= 100);
    }
}
