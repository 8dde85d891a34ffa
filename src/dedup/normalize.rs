//! Key and title normalization used for duplicate matching

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Words that carry no identity in a product title
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // English
        "a", "an", "the", "and", "or", "for", "with", "of", "in", "on", "to", "by", "at",
        "from", "new", "pack", "set",
        // French
        "le", "la", "les", "un", "une", "des", "du", "de", "et", "pour", "avec", "sur",
        "en", "au", "aux",
    ]
    .into_iter()
    .collect()
});

static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Minimum token length (exclusive) for a token to count toward similarity
pub const SIGNIFICANT_TOKEN_MIN_LEN: usize = 2;

/// Normalize a SKU/EAN: trimmed and case-folded
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Normalize a title: lower-case, punctuation stripped, whitespace
/// collapsed, stop words dropped
pub fn normalize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, " ");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");
    collapsed
        .split(' ')
        .filter(|token| !token.is_empty() && !STOP_WORDS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Distinct tokens of a normalized title longer than two characters
pub fn significant_tokens(normalized: &str) -> HashSet<String> {
    normalized
        .split_whitespace()
        .filter(|token| token.chars().count() > SIGNIFICANT_TOKEN_MIN_LEN)
        .map(String::from)
        .collect()
}

/// Token-set overlap: |common| / max(|a|, |b|); 0.0 when either side is empty
pub fn token_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let largest = a.len().max(b.len());
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let common = a.intersection(b).count();
    common as f32 / largest as f32
}

/// Similarity of two raw titles
pub fn title_similarity(a: &str, b: &str) -> f32 {
    let ta = significant_tokens(&normalize_title(a));
    let tb = significant_tokens(&normalize_title(b));
    token_similarity(&ta, &tb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  AbC-12 "), "abc-12");
        assert_eq!(normalize_key(""), "");
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(
            normalize_title("The  Red Running-Shoe, Size 9!!"),
            "red running shoe size 9"
        );
        assert_eq!(normalize_title("  ...  "), "");
        assert_eq!(normalize_title("Chaussure de course pour homme"), "chaussure course homme");
    }

    #[test]
    fn test_significant_tokens_skip_short() {
        let tokens = significant_tokens("red running shoe size 9 xl");
        assert!(tokens.contains("red"));
        assert!(!tokens.contains("9"));
        assert!(!tokens.contains("xl"));
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_title_similarity() {
        let sim = title_similarity("Red Running Shoe Size 9", "red running shoe size 9!!");
        assert!(sim >= 0.85, "similarity was {}", sim);

        let sim = title_similarity("Red Running Shoe", "Blue Leather Wallet");
        assert!(sim < 0.1);

        assert_eq!(title_similarity("", "Red Shoe"), 0.0);
    }

    #[test]
    fn test_similarity_uses_larger_set() {
        let a: HashSet<String> = ["red", "running", "shoe"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["red", "running", "shoe", "kids"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!((token_similarity(&a, &b) - 0.75).abs() < 1e-6);
    }
}
