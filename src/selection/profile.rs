//! Static model profiles and the registry that holds them.
//!
//! Scoring heuristics are data, not code: each [`ModelProfile`] carries its
//! weighted keyword table and its bonus rules, so variant heuristics are
//! expressed as configuration rather than separate code paths.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::features::{Category, PromptFeatures};

fn default_weight() -> f64 {
    1.0
}

/// A keyword and its multiplier on the per-keyword increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WeightedKeyword {
    /// Lower-case keyword; multi-word phrases match as substrings.
    pub term: String,
    /// Multiplier applied to the selector's keyword weight. Default: `1.0`.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl WeightedKeyword {
    /// Keyword with unit weight.
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            weight: 1.0,
        }
    }
}

/// Prompt signal that triggers a model-specific bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BonusSignal {
    /// `has_code_request` is set.
    CodeRequest,
    /// `has_question` is set.
    Question,
    /// The given category matched.
    Category(Category),
}

impl BonusSignal {
    /// Whether the signal fires for the given features.
    pub fn fires(&self, features: &PromptFeatures) -> bool {
        match self {
            Self::CodeRequest => features.has_code_request,
            Self::Question => features.has_question,
            Self::Category(c) => features.has_category(*c),
        }
    }
}

/// A small fixed bonus added when a signal fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BonusRule {
    /// Triggering signal.
    pub when: BonusSignal,
    /// Bonus amount, expected in `[0.05, 0.10]`.
    pub amount: f64,
}

/// Immutable per-model record, loaded at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModelProfile {
    /// Registry identifier (unique).
    pub id: String,
    /// Provider whose credential pool serves this model.
    pub provider: String,
    /// Upstream model identifier sent to the provider.
    pub model_id: String,
    /// Starting confidence before keyword and bonus adjustments.
    pub base_confidence: f64,
    /// Price in USD per 1 000 tokens.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Weighted keyword table.
    #[serde(default)]
    pub keywords: Vec<WeightedKeyword>,
    /// Domain tags this model specialises in.
    ///
    /// Informational only: carried through config and the exported schema
    /// for operators. Scoring reads `keywords` and `bonuses`; express a
    /// domain preference as a [`BonusSignal::Category`] rule.
    #[serde(default)]
    pub domains: BTreeSet<Category>,
    /// Model-specific heuristic bonuses.
    #[serde(default)]
    pub bonuses: Vec<BonusRule>,
}

/// Ordered collection of [`ModelProfile`]s.
///
/// Declaration order is significant: it breaks selection ties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelRegistry {
    profiles: Vec<ModelProfile>,
}

impl ModelRegistry {
    /// Build a registry from profiles in declaration order.
    pub fn new(profiles: Vec<ModelProfile>) -> Self {
        Self { profiles }
    }

    /// Look a profile up by registry id.
    pub fn get(&self, id: &str) -> Option<&ModelProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Profiles in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelProfile> {
        self.profiles.iter()
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether no model is registered.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Distinct providers referenced by the registry, in first-seen order.
    pub fn providers(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for p in &self.profiles {
            if !seen.contains(&p.provider) {
                seen.push(p.provider.clone());
            }
        }
        seen
    }

    /// The built-in six-model registry.
    ///
    /// The coding specialist is declared first so that it wins clamped ties.
    pub fn default_registry() -> Self {
        Self::new(vec![
            profile(
                "deepseek-coder",
                "deepseek",
                "deepseek-coder",
                0.95,
                0.0014,
                &[
                    "code",
                    "function",
                    "python",
                    "rust",
                    "javascript",
                    "algorithm",
                    "debug",
                    "sort",
                    "array",
                    "implement",
                    "bug",
                    "refactor",
                ],
                &[Category::Coding],
                vec![BonusRule {
                    when: BonusSignal::CodeRequest,
                    amount: 0.10,
                }],
            ),
            profile(
                "gpt-4o",
                "openai",
                "gpt-4o",
                0.90,
                0.005,
                &[
                    "explain",
                    "analyze",
                    "reason",
                    "plan",
                    "summarize",
                    "compare",
                    "math",
                ],
                &[Category::Reasoning, Category::Factual],
                vec![BonusRule {
                    when: BonusSignal::Question,
                    amount: 0.05,
                }],
            ),
            profile(
                "claude-3-5-sonnet",
                "anthropic",
                "claude-3-5-sonnet-latest",
                0.90,
                0.003,
                &[
                    "write", "essay", "story", "creative", "review", "ethics", "nuance",
                ],
                &[Category::Creative, Category::Reasoning],
                vec![BonusRule {
                    when: BonusSignal::Category(Category::Creative),
                    amount: 0.05,
                }],
            ),
            profile(
                "gemini-1.5-pro",
                "google",
                "gemini-1.5-pro",
                0.88,
                0.0035,
                &["research", "data", "facts", "history", "compare", "summarize"],
                &[Category::Factual],
                vec![BonusRule {
                    when: BonusSignal::Category(Category::Factual),
                    amount: 0.05,
                }],
            ),
            profile(
                "mistral-large",
                "mistral",
                "mistral-large-latest",
                0.85,
                0.002,
                &[
                    "translate",
                    "french",
                    "spanish",
                    "german",
                    "language",
                    "multilingual",
                ],
                &[Category::Translation],
                vec![BonusRule {
                    when: BonusSignal::Category(Category::Translation),
                    amount: 0.10,
                }],
            ),
            profile(
                "llama-3-70b",
                "groq",
                "llama3-70b-8192",
                0.82,
                0.0008,
                &["chat", "quick", "simple", "sentiment", "feel", "tone"],
                &[Category::Sentiment],
                vec![BonusRule {
                    when: BonusSignal::Category(Category::Sentiment),
                    amount: 0.05,
                }],
            ),
        ])
    }
}

#[allow(clippy::too_many_arguments)]
fn profile(
    id: &str,
    provider: &str,
    model_id: &str,
    base_confidence: f64,
    cost_per_1k_tokens: f64,
    keywords: &[&str],
    domains: &[Category],
    bonuses: Vec<BonusRule>,
) -> ModelProfile {
    ModelProfile {
        id: id.to_string(),
        provider: provider.to_string(),
        model_id: model_id.to_string(),
        base_confidence,
        cost_per_1k_tokens,
        keywords: keywords.iter().map(|k| WeightedKeyword::new(*k)).collect(),
        domains: domains.iter().copied().collect(),
        bonuses,
    }
}
