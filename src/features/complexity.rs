//! Prompt complexity signal.
//!
//! Produces the scalar `complexity` carried by
//! [`PromptFeatures`](super::PromptFeatures), a value in `0.0..=1.0`.
//!
//! ## Heuristics
//!
//! 1. **Token count**: more than 500 whitespace-delimited tokens → +0.3
//! 2. **Code blocks**: presence of fenced code blocks (` ``` `) → +0.2
//! 3. **Multi-step instructions**: two or more numbered list items → +0.2
//! 4. **Ambiguous references**: words like "it", "that", "those" → +0.15
//! 5. **Domain terms**: systems or quantitative vocabulary → +0.15
//!
//! The raw sum is clamped to `[0.0, 1.0]`.

/// Stateless prompt complexity scorer.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct ComplexityScorer {
    /// Minimum token count before the "long prompt" signal fires.
    token_count_threshold: usize,
}

impl Default for ComplexityScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplexityScorer {
    /// Create a new scorer with the default token-count threshold (500).
    pub fn new() -> Self {
        Self {
            token_count_threshold: 500,
        }
    }

    /// Create a new scorer with a custom token-count threshold.
    pub fn with_token_threshold(token_count_threshold: usize) -> Self {
        Self {
            token_count_threshold,
        }
    }

    /// Score a prompt for complexity.
    ///
    /// # Example
    ///
    /// ```rust
    /// use critique_orchestrator::features::complexity::ComplexityScorer;
    /// let scorer = ComplexityScorer::new();
    /// assert!(scorer.score("Say hello") < 0.2);
    /// ```
    pub fn score(&self, prompt: &str) -> f64 {
        let lower = prompt.to_lowercase();
        let total = self.token_count_signal(prompt)
            + code_block_signal(prompt)
            + multi_step_signal(prompt)
            + ambiguous_reference_signal(&lower)
            + domain_term_signal(&lower);
        total.clamp(0.0, 1.0)
    }

    fn token_count_signal(&self, prompt: &str) -> f64 {
        if prompt.split_whitespace().count() > self.token_count_threshold {
            0.3
        } else {
            0.0
        }
    }
}

fn code_block_signal(prompt: &str) -> f64 {
    if prompt.contains("```") {
        0.2
    } else {
        0.0
    }
}

/// Counts lines that open with `N.` (digits, a dot, then whitespace or end of line).
fn multi_step_signal(prompt: &str) -> f64 {
    let numbered_items = prompt
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                return false;
            }
            let mut rest = trimmed[digits..].chars();
            rest.next() == Some('.') && rest.next().map_or(true, char::is_whitespace)
        })
        .count();

    if numbered_items >= 2 {
        0.2
    } else {
        0.0
    }
}

const AMBIGUOUS_PATTERNS: &[&str] = &[
    " it ",
    " that ",
    " the thing ",
    " this thing ",
    " those ",
    " these ",
    " them ",
];

/// Needs at least two distinct patterns to fire.
fn ambiguous_reference_signal(lower: &str) -> f64 {
    let count = AMBIGUOUS_PATTERNS
        .iter()
        .filter(|pat| lower.contains(*pat))
        .count();
    if count >= 2 {
        0.15
    } else {
        0.0
    }
}

const SYSTEMS_TERMS: &[&str] = &[
    "borrow checker",
    "lifetime",
    "async fn",
    "concurrency",
    "mutex",
    "deadlock",
    "memory leak",
    "race condition",
    "kernel",
    "distributed",
];

const QUANT_TERMS: &[&str] = &[
    "monte carlo",
    "sharpe ratio",
    "portfolio",
    "yield curve",
    "derivative pricing",
    "eigenvalue",
    "regression",
    "bayesian",
];

fn domain_term_signal(lower: &str) -> f64 {
    let systems_hits = SYSTEMS_TERMS.iter().filter(|t| lower.contains(*t)).count();
    let quant_hits = QUANT_TERMS.iter().filter(|t| lower.contains(*t)).count();

    if systems_hits >= 2 || quant_hits >= 2 || (systems_hits >= 1 && quant_hits >= 1) {
        0.15
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_prompt_scores_zero() {
        assert_eq!(ComplexityScorer::new().score("Say hello"), 0.0);
    }

    #[test]
    fn test_empty_prompt_scores_zero() {
        assert_eq!(ComplexityScorer::new().score(""), 0.0);
    }

    #[test]
    fn test_code_block_adds_signal() {
        let score = ComplexityScorer::new().score("Fix:\n```\nfoo()\n```");
        assert!((score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_numbered_steps_need_two_items() {
        let scorer = ComplexityScorer::new();
        assert_eq!(scorer.score("1. only one step"), 0.0);
        let score = scorer.score("1. first\n2. second");
        assert!((score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_decimal_number_is_not_a_step() {
        assert_eq!(ComplexityScorer::new().score("3.14 is pi\n2.71 is e"), 0.0);
    }

    #[test]
    fn test_long_prompt_custom_threshold() {
        let scorer = ComplexityScorer::with_token_threshold(3);
        let score = scorer.score("one two three four");
        assert!((score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_domain_terms_require_two_hits() {
        let scorer = ComplexityScorer::new();
        assert_eq!(scorer.score("explain a mutex"), 0.0);
        let score = scorer.score("find the deadlock around this mutex");
        assert!((score - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_score_is_clamped() {
        let scorer = ComplexityScorer::with_token_threshold(1);
        let prompt = "Fix it so that those work:\n```\nx\n```\n1. mutex\n2. deadlock them now";
        let score = scorer.score(prompt);
        assert!(score <= 1.0);
        assert!(score > 0.8);
    }
}
