//! Query keyword extraction and content normalization.

use std::collections::BTreeSet;

/// Words that carry no retrieval signal.
const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "could",
    "did", "do", "does", "for", "from", "had", "has", "have", "how", "i", "if", "in", "into",
    "is", "it", "its", "me", "my", "of", "on", "or", "our", "should", "so", "than", "that",
    "the", "their", "them", "then", "there", "these", "they", "this", "to", "was", "we",
    "were", "what", "when", "where", "which", "who", "why", "will", "with", "would", "you",
    "your",
];

/// Lowercased, deduplicated content words of `text`.
///
/// Splits on anything that is not alphanumeric, drops stop words and
/// single-character tokens.
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Number of `keywords` that occur in `text` as whole words.
pub fn overlap(keywords: &BTreeSet<String>, text: &str) -> usize {
    if keywords.is_empty() || text.is_empty() {
        return 0;
    }
    let words = extract_keywords(text);
    keywords.intersection(&words).count()
}

/// Lowercase, collapse whitespace, and keep the first `len` characters.
pub fn normalize_prefix(content: &str, len: usize) -> String {
    let collapsed = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_content_words() {
        let kw = extract_keywords("What is the difference between Rust and Go?");
        let expected: BTreeSet<String> = ["difference", "between", "rust", "go"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(kw, expected);
    }

    #[test]
    fn drops_single_chars_and_punctuation() {
        let kw = extract_keywords("compare X and Y!!");
        assert_eq!(kw.into_iter().collect::<Vec<_>>(), vec!["compare".to_string()]);
    }

    #[test]
    fn overlap_counts_whole_words() {
        let kw = extract_keywords("tokio runtime");
        assert_eq!(overlap(&kw, "The Tokio runtime schedules tasks"), 2);
        assert_eq!(overlap(&kw, "tokiox runtimes"), 0);
        assert_eq!(overlap(&BTreeSet::new(), "tokio"), 0);
    }

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_prefix("  Hello\n\n  World  ", 100), "hello world");
        assert_eq!(normalize_prefix("ABCDEF", 3), "abc");
        assert_eq!(
            normalize_prefix("Same  text", 100),
            normalize_prefix("same text", 100)
        );
    }
}
