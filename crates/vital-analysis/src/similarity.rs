//! Title similarity for proposal dedupe.
//!
//! Titles are tokenized, stopword-stripped, and compared with a
//! matching-blocks ratio (2·M / (|a| + |b|), M = total matched chars across
//! recursively-found longest common substrings).

use std::sync::LazyLock;

use regex::Regex;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

const TITLE_STOPWORDS: &[&str] = &[
    "and",
    "for",
    "the",
    "with",
    "from",
    "into",
    "your",
    "this",
    "that",
    "user",
    "daily",
    "today",
    "toward",
    "towards",
    "improve",
    "improvement",
    "enhance",
    "enhancement",
];

pub fn normalize_title_tokens(title: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&title.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|t| t.len() >= 3 && !TITLE_STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Similarity of two proposal titles in [0, 1] after normalization.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a_tokens = normalize_title_tokens(a);
    let b_tokens = normalize_title_tokens(b);
    if a_tokens.is_empty() || b_tokens.is_empty() {
        return 0.0;
    }
    let a_norm = a_tokens.join(" ");
    let b_norm = b_tokens.join(" ");
    sequence_ratio(a_norm.as_bytes(), b_norm.as_bytes())
}

fn longest_common_block(a: &[u8], b: &[u8]) -> (usize, usize, usize) {
    // Classic DP over substring lengths; titles are short so O(n·m) is fine.
    let (mut best_len, mut best_a, mut best_b) = (0usize, 0usize, 0usize);
    let mut prev = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        let mut row = vec![0usize; b.len() + 1];
        for (j, &cb) in b.iter().enumerate() {
            if ca == cb {
                let len = prev[j] + 1;
                row[j + 1] = len;
                if len > best_len {
                    best_len = len;
                    best_a = i + 1 - len;
                    best_b = j + 1 - len;
                }
            }
        }
        prev = row;
    }
    (best_a, best_b, best_len)
}

fn matched_chars(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (ai, bi, len) = longest_common_block(a, b);
    if len == 0 {
        return 0;
    }
    len + matched_chars(&a[..ai], &b[..bi]) + matched_chars(&a[ai + len..], &b[bi + len..])
}

fn sequence_ratio(a: &[u8], b: &[u8]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    (2.0 * matched_chars(a, b) as f64) / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_titles_score_one() {
        assert!((title_similarity("Increase Zone 2 volume", "Increase Zone 2 volume") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stopwords_do_not_separate_titles() {
        let sim = title_similarity(
            "Improve your sodium intake today",
            "Sodium intake",
        );
        assert!(sim >= 0.82, "sim = {sim}");
    }

    #[test]
    fn unrelated_titles_score_low() {
        let sim = title_similarity("Increase fiber intake", "Shift bedtime earlier");
        assert!(sim < 0.5, "sim = {sim}");
    }

    #[test]
    fn empty_after_stopwords_scores_zero() {
        assert_eq!(title_similarity("the and for", "sodium"), 0.0);
    }
}
