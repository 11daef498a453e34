//! Model scoring and arg-max selection.
//!
//! Per model: `base + keyword_weight × Σ matched keyword weights + Σ fired
//! bonuses + jitter`, clamped to `[0, 1]`. Selection is the arg-max, ties
//! broken by declaration order.
//!
//! The jitter is deliberate load-spreading between equally qualified models
//! under identical prompts. Set [`SelectorConfig::jitter`] to `0.0` for fully
//! deterministic scoring.
//!
//! A selection is `degraded` when no category matched and no model gained
//! anything from keywords or bonuses, so every score is base confidence plus
//! jitter. A prompt that misses every category but still fires a configured
//! keyword or bonus is scored normally and not flagged.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::profile::{ModelProfile, ModelRegistry};
use crate::features::{FeatureExtractor, KeywordIndex, PromptFeatures};

/// Scoring knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    /// Increment per matched keyword of unit weight. Default: `0.05`.
    pub keyword_weight: f64,
    /// Half-width of the symmetric random jitter. Default: `0.02`.
    pub jitter: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.05,
            jitter: 0.02,
        }
    }
}

/// One model's confidence for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    /// Registry id.
    pub model: String,
    /// Confidence in `[0, 1]`.
    pub score: f64,
    /// Number of keywords that matched.
    pub matched_keywords: usize,
}

/// Outcome of scoring every registered model against one prompt.
///
/// Scores are independent (they need not sum to 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    /// Every registered model's score, in declaration order.
    pub scores: Vec<ModelScore>,
    /// Registry id of the arg-max model.
    pub selected: String,
    /// Score of the selected model.
    pub confidence: f64,
    /// Features that produced these scores.
    pub features: PromptFeatures,
    /// No category and no keyword matched: scores are base confidence plus jitter.
    pub degraded: bool,
}

impl SelectionResult {
    /// Score of a model by registry id.
    pub fn score_of(&self, model: &str) -> Option<f64> {
        self.scores.iter().find(|s| s.model == model).map(|s| s.score)
    }

    /// All models by descending score; ties keep declaration order.
    pub fn ranking(&self) -> Vec<&ModelScore> {
        let mut ranked: Vec<&ModelScore> = self.scores.iter().collect();
        // `sort_by` is stable, so equal scores stay in declaration order.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    /// Non-selected models by descending score: the critique dispatch order.
    pub fn critique_targets(&self) -> Vec<String> {
        self.ranking()
            .into_iter()
            .filter(|s| s.model != self.selected)
            .map(|s| s.model.clone())
            .collect()
    }
}

/// Scores prompts against a [`ModelRegistry`].
#[derive(Debug, Clone)]
pub struct ModelSelector {
    registry: ModelRegistry,
    config: SelectorConfig,
    extractor: FeatureExtractor,
}

impl ModelSelector {
    /// Create a selector over a registry.
    pub fn new(registry: ModelRegistry, config: SelectorConfig) -> Self {
        Self {
            registry,
            config,
            extractor: FeatureExtractor::new(),
        }
    }

    /// The registry this selector scores against.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Extract features and select in one step.
    pub fn select_prompt(&self, prompt: &str) -> Option<SelectionResult> {
        let features = self.extractor.extract(prompt);
        self.select(prompt, features)
    }

    /// Score every registered model and pick the arg-max.
    ///
    /// Returns `None` only when the registry is empty; configuration
    /// validation rejects that case at load time.
    pub fn select(&self, prompt: &str, features: PromptFeatures) -> Option<SelectionResult> {
        let index = KeywordIndex::new(prompt);
        let mut rng = rand::thread_rng();

        let mut boosted = false;
        let scores: Vec<ModelScore> = self
            .registry
            .iter()
            .map(|profile| {
                let jitter = if self.config.jitter > 0.0 {
                    rng.gen_range(-self.config.jitter..=self.config.jitter)
                } else {
                    0.0
                };
                let (score, bonus_fired) = self.score_profile(profile, &index, &features, jitter);
                boosted |= bonus_fired || score.matched_keywords > 0;
                score
            })
            .collect();

        let mut best: Option<&ModelScore> = None;
        for candidate in &scores {
            // Strict comparison: the earlier declaration wins ties.
            if best.map_or(true, |b| candidate.score > b.score) {
                best = Some(candidate);
            }
        }
        let best = best?;
        let selected = best.model.clone();
        let confidence = best.score;

        let degraded = features.categories.is_empty() && !boosted;
        if degraded {
            warn!(
                selected = %selected,
                "no category matched, selecting on base confidence"
            );
        }
        debug!(selected = %selected, confidence, domain = %features.domain, "model selected");

        Some(SelectionResult {
            scores,
            selected,
            confidence,
            features,
            degraded,
        })
    }

    fn score_profile(
        &self,
        profile: &ModelProfile,
        index: &KeywordIndex,
        features: &PromptFeatures,
        jitter: f64,
    ) -> (ModelScore, bool) {
        let mut matched = 0_usize;
        let mut keyword_total = 0.0_f64;
        for kw in &profile.keywords {
            if index.matches(&kw.term.to_lowercase()) {
                matched += 1;
                keyword_total += kw.weight;
            }
        }

        let mut fired = false;
        let bonus: f64 = profile
            .bonuses
            .iter()
            .filter(|b| b.when.fires(features))
            .inspect(|_| fired = true)
            .map(|b| b.amount)
            .sum();

        let raw =
            profile.base_confidence + self.config.keyword_weight * keyword_total + bonus + jitter;

        let score = ModelScore {
            model: profile.id.clone(),
            score: raw.clamp(0.0, 1.0),
            matched_keywords: matched,
        };
        (score, fired)
    }
}
