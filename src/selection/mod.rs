//! # Stage: Model Selection
//!
//! ## Responsibility
//! Score every registered [`ModelProfile`] against a prompt and its
//! [`PromptFeatures`](crate::features::PromptFeatures), returning the full
//! score map plus the arg-max choice.
//!
//! ## Guarantees
//! - Total: a non-empty registry always yields exactly one selection and a
//!   score in `[0, 1]` for every registered model.
//! - Ordered: ties are broken by declaration order; critique targets come out
//!   in descending score order, so the most confident dissent is asked first.
//! - Graceful: prompts that match nothing are scored on base confidence and
//!   flagged `degraded`, never rejected.
//!
//! ## NOT Responsible For
//! - Calling providers (that belongs to `gateway`)
//! - Learning from outcomes (scores are static keyword heuristics)

pub mod profile;
pub mod selector;

// Re-exports for convenience
pub use profile::{BonusRule, BonusSignal, ModelProfile, ModelRegistry, WeightedKeyword};
pub use selector::{ModelScore, ModelSelector, SelectionResult, SelectorConfig};
