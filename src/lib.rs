//! # critique-orchestrator
//!
//! Routes a prompt to the best-suited of several interchangeable LLM providers,
//! collects critiques of the answer from the remaining providers, and iterates
//! toward a better answer under an explicit policy.
//!
//! ## Architecture
//!
//! Data flows one way through the engine:
//! ```text
//! prompt → features → ranked models → primary response → critiques → decision
//!                                            ▲                             │
//!                                            └──── refined prompt ◄────────┘
//! ```
//!
//! - [`features`] turns prompt text into a [`PromptFeatures`] set.
//! - [`selection`] scores every registered [`ModelProfile`].
//! - [`credentials`] rotates API keys per provider with health tracking.
//! - [`gateway`] issues one generation with a single credential-swap retry.
//! - [`critique`] fans critique requests out concurrently under a deadline.
//! - [`engine`] drives the per-thread state machine and persists snapshots.
//! - [`config`] loads a TOML description of providers, keys and policy.
//! - [`metrics`] exposes Prometheus counters for threads, calls and critiques.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod credentials;
pub mod critique;
pub mod engine;
pub mod features;
pub mod gateway;
pub mod metrics;
pub mod selection;

// Re-exports for convenience
pub use config::OrchestratorConfig;
pub use credentials::{CredentialPool, CredentialPools, HealthState};
pub use critique::{Critique, CritiqueBatch, CritiqueCollector, FocusDimension};
pub use engine::{
    CancelHandle, ConversationThread, InMemoryThreadStore, JsonFileThreadStore,
    OrchestrationPolicy, OrchestrationResult, Orchestrator, ThreadStatus, ThreadStore,
};
pub use features::{Category, FeatureExtractor, PromptFeatures};
pub use gateway::{
    EchoBackend, FailureKind, Generation, GenerationAttempt, ProviderBackend, ProviderGateway,
};
pub use selection::{ModelProfile, ModelRegistry, ModelSelector, SelectionResult};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Credential and gateway failures are recovered locally up to the retry
/// bounds of [`ProviderGateway`] and only then surfaced here. Critique
/// failures never are.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// Every credential for the provider is cooling down; retry later.
    #[error("all credentials for provider '{provider}' are cooling down")]
    PoolExhausted {
        /// Provider whose pool is exhausted.
        provider: String,
    },

    /// Transient upstream failure that survived one credential swap.
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable {
        /// Provider that failed.
        provider: String,
        /// Last classified failure.
        reason: String,
    },

    /// Fatal upstream rejection (bad request, unsupported model, content policy).
    #[error("provider '{provider}' rejected the request ({kind}): {reason}")]
    ProviderRejected {
        /// Provider that rejected the request.
        provider: String,
        /// Classified failure kind.
        kind: gateway::FailureKind,
        /// Upstream message.
        reason: String,
    },

    /// No credentials are registered for the provider (misconfiguration).
    #[error("no credential registered for provider '{provider}'")]
    NoCredentialAvailable {
        /// Provider with no registered keys.
        provider: String,
    },

    /// Accumulated cost reached the policy limit. A policy stop, not a failure.
    #[error("cost limit reached: spent ${spent:.6} of ${limit:.6}")]
    CostLimitExceeded {
        /// Cost accumulated so far (USD).
        spent: f64,
        /// Configured limit (USD).
        limit: f64,
    },

    /// Feature extraction matched nothing; selection used base confidence only.
    #[error("no prompt category matched; selection fell back to base confidence")]
    SelectionDegraded,

    /// The submitted prompt was empty or whitespace-only.
    #[error("prompt must not be empty")]
    EmptyPrompt,

    /// The orchestration policy violates its documented bounds.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// A thread status change outside the allowed transition graph.
    #[error("invalid thread transition {from} -> {to}")]
    InvalidTransition {
        /// Status before the attempted transition.
        from: engine::ThreadStatus,
        /// Requested status.
        to: engine::ThreadStatus,
    },

    /// A thread store operation failed.
    #[error("thread store error: {0}")]
    Store(String),

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Short stable label used for metrics and log fields.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderRejected { .. } => "provider_rejected",
            Self::NoCredentialAvailable { .. } => "no_credential",
            Self::CostLimitExceeded { .. } => "cost_limit",
            Self::SelectionDegraded => "selection_degraded",
            Self::EmptyPrompt => "empty_prompt",
            Self::InvalidPolicy(_) => "invalid_policy",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Store(_) => "store",
            Self::ConfigError(_) => "config",
            Self::Other(_) => "other",
        }
    }
}
