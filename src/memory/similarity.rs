//! Token-overlap similarity between error reports.
//!
//! Deterministic for identical inputs: no clocks, no randomness, ordered sets.

use std::collections::BTreeSet;

/// Share of the score contributed by an exact error type match
const TYPE_WEIGHT: f64 = 0.3;
/// Ranking weight for records whose fix did not work
const FAILED_FIX_WEIGHT: f64 = 0.25;
/// Oldest record keeps this share of its score; newest keeps all of it
const RECENCY_FLOOR: f64 = 0.8;

const STOP_WORDS: &[&str] = &[
    "an", "and", "at", "be", "for", "in", "is", "it", "of", "on", "or", "the", "to", "was", "with",
];

/// Lowercase alphanumeric tokens, at least two characters, minus stop words
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Token set for an error: type, message and tags
pub fn error_tokens<'a>(
    error_type: &str,
    error_message: &str,
    tags: impl IntoIterator<Item = &'a String>,
) -> BTreeSet<String> {
    let mut tokens = tokenize(error_type);
    tokens.extend(tokenize(error_message));
    tokens.extend(tags.into_iter().map(|t| t.to_lowercase()));
    tokens
}

/// Jaccard index of two token sets; 0 when both are empty
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Similarity in `[0, 1]`: token overlap plus a bonus for the same error type
pub fn similarity(
    query_type: &str,
    query_tokens: &BTreeSet<String>,
    record_type: &str,
    record_tokens: &BTreeSet<String>,
) -> f64 {
    let same_type = !query_type.trim().is_empty()
        && query_type.trim().eq_ignore_ascii_case(record_type.trim());
    let type_score = if same_type { 1.0 } else { 0.0 };
    (1.0 - TYPE_WEIGHT) * jaccard(query_tokens, record_tokens) + TYPE_WEIGHT * type_score
}

/// Ranking score: similarity weighted by outcome and insertion recency.
///
/// `position` is the record's index in insertion order out of `total`.
pub fn rank_score(similarity: f64, success: bool, position: usize, total: usize) -> f64 {
    let outcome = if success { 1.0 } else { FAILED_FIX_WEIGHT };
    let recency = if total <= 1 {
        1.0
    } else {
        RECENCY_FLOOR + (1.0 - RECENCY_FLOOR) * position as f64 / (total - 1) as f64
    };
    similarity * outcome * recency
}
