//! Keyword-ratio sentiment scoring for feedback comments.
//!
//! This is deliberately naive — a placeholder scoring function, not a
//! statistical model. The score is `positive_ratio - negative_ratio` over the
//! comment's tokens, which bounds it to [-1, 1] by construction. Keep the
//! keyword lists and formula stable: stored scores are only comparable across
//! rows if every ingestion used the same function.

use crate::models::SentimentLabel;

/// Score magnitude above which a comment is labeled positive/negative at
/// ingestion time. Distinct from the aggregator's distribution threshold in
/// `feedback.rs` — the label reflects per-comment tone, while the summary
/// distribution only counts strongly polarized feedback.
pub const LABEL_THRESHOLD: f64 = 0.1;

const POSITIVE_WORDS: &[&str] = &[
    "good",
    "great",
    "excellent",
    "amazing",
    "awesome",
    "wonderful",
    "fantastic",
    "helpful",
    "love",
    "perfect",
    "best",
    "useful",
    "reliable",
    "fast",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad",
    "terrible",
    "awful",
    "horrible",
    "useless",
    "worst",
    "hate",
    "broken",
    "slow",
    "poor",
    "buggy",
    "disappointing",
    "unreliable",
    "crash",
];

fn tokenize(comment: &str) -> Vec<String> {
    comment
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Compute the sentiment score for a comment, or `None` when there is no
/// text to score (missing or whitespace-only comments stay unscored).
pub fn score(comment: &str) -> Option<f64> {
    let tokens = tokenize(comment);
    if tokens.is_empty() {
        return None;
    }
    let total = tokens.len() as f64;
    let positive = tokens
        .iter()
        .filter(|t| POSITIVE_WORDS.contains(&t.as_str()))
        .count() as f64;
    let negative = tokens
        .iter()
        .filter(|t| NEGATIVE_WORDS.contains(&t.as_str()))
        .count() as f64;
    Some(positive / total - negative / total)
}

/// Bucket a score into the ingestion-time label.
pub fn label(score: f64) -> SentimentLabel {
    if score > LABEL_THRESHOLD {
        SentimentLabel::Positive
    } else if score < -LABEL_THRESHOLD {
        SentimentLabel::Negative
    } else {
        SentimentLabel::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_comment_scores_positive() {
        // 2 positive words out of 5 tokens -> 0.4
        let s = score("this is great and wonderful").unwrap();
        assert!((s - 0.4).abs() < f64::EPSILON);
        assert!(s > LABEL_THRESHOLD);
        assert_eq!(label(s), SentimentLabel::Positive);
    }

    #[test]
    fn test_negative_comment_scores_negative() {
        let s = score("this is terrible and awful").unwrap();
        assert!((s + 0.4).abs() < f64::EPSILON);
        assert_eq!(label(s), SentimentLabel::Negative);
    }

    #[test]
    fn test_neutral_comment_scores_zero() {
        let s = score("the sky is blue").unwrap();
        assert_eq!(s, 0.0);
        assert_eq!(label(s), SentimentLabel::Neutral);
    }

    #[test]
    fn test_empty_comment_is_unscored() {
        assert_eq!(score(""), None);
        assert_eq!(score("   \t\n"), None);
    }

    #[test]
    fn test_mixed_comment_balances_out() {
        // One positive, one negative over 4 tokens -> 0.0
        let s = score("great tool but slow").unwrap();
        assert_eq!(s, 0.0);
        assert_eq!(label(s), SentimentLabel::Neutral);
    }

    #[test]
    fn test_tokenizer_is_case_and_punctuation_insensitive() {
        let s = score("GREAT!!! Absolutely great.").unwrap();
        // 2 matches out of 3 tokens
        assert!((s - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_stays_within_unit_interval() {
        let s = score("great great great").unwrap();
        assert_eq!(s, 1.0);
        let s = score("awful awful").unwrap();
        assert_eq!(s, -1.0);
    }

    #[test]
    fn test_boundary_score_is_neutral() {
        // Exactly at the threshold must not be labeled positive
        assert_eq!(label(LABEL_THRESHOLD), SentimentLabel::Neutral);
        assert_eq!(label(-LABEL_THRESHOLD), SentimentLabel::Neutral);
    }
}
