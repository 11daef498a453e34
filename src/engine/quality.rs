//! Quality estimate derived from critiques.
//!
//! Each critique contributes a score in `[0, 1]`: the explicit
//! `Rating: N/10` line when the reviewer wrote one, otherwise a severity
//! heuristic over negative and positive markers. The thread quality is the
//! mean critique score, or the primary model's confidence when no critique
//! arrived.

use serde::{Deserialize, Serialize};

use crate::critique::Critique;

/// Starting point of the severity heuristic.
const NEUTRAL: f64 = 0.7;

const NEGATIVE_MARKERS: &[&str] = &[
    "incorrect",
    "wrong",
    "error",
    "bug",
    "missing",
    "fails",
    "unclear",
    "misleading",
    "inaccurate",
    "flaw",
    "incomplete",
    "confusing",
];

const POSITIVE_MARKERS: &[&str] = &[
    "correct",
    "accurate",
    "clear",
    "well",
    "good",
    "excellent",
    "thorough",
    "solid",
];

/// Where a critique score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// An explicit `Rating: N/10` line.
    Rating,
    /// Marker-counting heuristic.
    Heuristic,
    /// No critiques; the primary model's selection confidence.
    PrimaryConfidence,
}

/// Thread-level quality estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityEstimate {
    /// Score in `[0, 1]`.
    pub score: f64,
    /// Critiques that contributed.
    pub critiques: usize,
    /// Source of the score; `Rating` only when every critique carried one.
    pub source: ScoreSource,
}

/// Parse `Rating: N/10` (case-insensitive, decimals allowed, last one wins).
pub fn parse_rating(text: &str) -> Option<f64> {
    let lower = text.to_lowercase();
    let mut found = None;
    for (idx, _) in lower.match_indices("rating") {
        let rest = lower[idx + "rating".len()..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let rest = rest.trim_start();
        let number: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let Ok(value) = number.trim_end_matches('.').parse::<f64>() else {
            continue;
        };
        let after = rest[number.len()..].trim_start();
        let scale = if let Some(denom) = after.strip_prefix('/') {
            let digits: String = denom
                .trim_start()
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse::<f64>().ok().filter(|d| *d > 0.0).unwrap_or(10.0)
        } else {
            10.0
        };
        found = Some((value / scale).clamp(0.0, 1.0));
    }
    found
}

fn count_words(lower: &str, markers: &[&str]) -> usize {
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    markers.iter().filter(|m| words.contains(m)).count()
}

/// Severity heuristic: `0.7 − 0.1 × negatives + 0.05 × positives`, clamped.
pub fn heuristic_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let negatives = count_words(&lower, NEGATIVE_MARKERS) as f64;
    let positives = count_words(&lower, POSITIVE_MARKERS) as f64;
    (NEUTRAL - 0.1 * negatives + 0.05 * positives).clamp(0.0, 1.0)
}

/// Score one critique text and report which method was used.
pub fn critique_score(text: &str) -> (f64, ScoreSource) {
    match parse_rating(text) {
        Some(score) => (score, ScoreSource::Rating),
        None => (heuristic_score(text), ScoreSource::Heuristic),
    }
}

/// Mean critique score, or `primary_confidence` when there are none.
pub fn estimate(critiques: &[Critique], primary_confidence: f64) -> QualityEstimate {
    if critiques.is_empty() {
        return QualityEstimate {
            score: primary_confidence.clamp(0.0, 1.0),
            critiques: 0,
            source: ScoreSource::PrimaryConfidence,
        };
    }

    let mut total = 0.0;
    let mut all_rated = true;
    for c in critiques {
        let (score, source) = critique_score(&c.text);
        total += score;
        all_rated &= source == ScoreSource::Rating;
    }

    QualityEstimate {
        score: total / critiques.len() as f64,
        critiques: critiques.len(),
        source: if all_rated {
            ScoreSource::Rating
        } else {
            ScoreSource::Heuristic
        },
    }
}
