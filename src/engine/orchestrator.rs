//! The orchestration loop.
//!
//! One call to [`Orchestrator::orchestrate`] drives one [`ConversationThread`]
//! from `INITIALIZING` to a terminal status:
//!
//! 1. select the primary model and ask it for a response;
//! 2. fan critiques out to every other model under a deadline;
//! 3. score the response from the critiques;
//! 4. complete, stop on budget, or refine the prompt and go again.
//!
//! Cancellation is checked only between transitions; an in-flight provider
//! call always runs to completion or to its own timeout.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::quality::{self, QualityEstimate};
use super::store::ThreadStore;
use super::thread::{ConversationThread, OrchestrationPolicy, ThreadStatus};
use crate::critique::{Critique, CritiqueCollector, CritiqueConfig, CritiqueTarget};
use crate::features::FeatureExtractor;
use crate::gateway::ProviderGateway;
use crate::selection::{ModelSelector, SelectionResult};
use crate::{metrics, OrchestratorError};

/// Whether the primary model may change between iterations of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRetention {
    /// Keep the first selection for the whole thread.
    #[default]
    Fixed,
    /// Re-run selection on every refined prompt.
    Reselect,
}

/// Engine timing and retention knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Timeout for each primary call. Default: 30 s.
    pub primary_timeout: Duration,
    /// Critique deadline and per-call timeout.
    pub critique: CritiqueConfig,
    /// Primary model retention across iterations.
    pub retention: ModelRetention,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(30),
            critique: CritiqueConfig::default(),
            retention: ModelRetention::Fixed,
        }
    }
}

/// Cloneable stop flag, honoured at transition boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop at the next transition boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What the caller gets back from one orchestration.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    /// Thread identifier, usable with [`Orchestrator::load_thread`].
    pub thread_id: Uuid,
    /// Terminal status.
    pub status: ThreadStatus,
    /// Best response across iterations, if any primary call succeeded.
    pub response: Option<String>,
    /// Registry id of the model that produced `response`.
    pub primary_model: Option<String>,
    /// Critiques of the last evaluated response, in rank order.
    pub critiques: Vec<Critique>,
    /// Quality of `response`, if it was evaluated.
    pub quality: Option<f64>,
    /// Iterations run.
    pub iterations: u32,
    /// Total cost in USD.
    pub total_cost: f64,
    /// Initial selection, with the full score map.
    pub selection: SelectionResult,
    /// Non-fatal conditions: degraded selection, cost limit reached.
    pub warnings: Vec<OrchestratorError>,
    /// Classified primary failure when `status` is `FAILED`.
    pub error: Option<OrchestratorError>,
    /// Final thread snapshot.
    pub thread: ConversationThread,
}

impl OrchestrationResult {
    /// JSON view for logs and the demo binary.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "thread_id": self.thread_id,
            "status": self.status,
            "primary_model": self.primary_model,
            "response": self.response,
            "quality": self.quality,
            "iterations": self.iterations,
            "total_cost": self.total_cost,
            "selection": {
                "selected": self.selection.selected,
                "confidence": self.selection.confidence,
                "degraded": self.selection.degraded,
                "scores": self.selection.scores,
            },
            "critiques": self.critiques,
            "warnings": self.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
            "error": self.error.as_ref().map(|e| e.to_string()),
        })
    }
}

/// Build the follow-up prompt for the next iteration.
pub fn refinement_prompt(original: &str, previous_answer: &str, critiques: &[Critique]) -> String {
    let mut feedback = String::new();
    for c in critiques {
        feedback.push_str(&format!("- [{}] {}\n", c.focus, c.text.trim()));
    }
    if feedback.is_empty() {
        feedback.push_str("- No reviewer feedback was available; tighten and verify the answer.\n");
    }
    format!(
        "{original}\n\n\
         A previous answer to this request was:\n{previous_answer}\n\n\
         Reviewers raised the following points:\n{feedback}\n\
         Write an improved answer that addresses these points."
    )
}

/// Drives threads through select → respond → critique → decide.
///
/// Threads never share mutable state; one orchestrator can run many
/// threads concurrently.
#[derive(Clone)]
pub struct Orchestrator {
    extractor: FeatureExtractor,
    selector: Arc<ModelSelector>,
    gateway: Arc<ProviderGateway>,
    collector: CritiqueCollector,
    store: Arc<dyn ThreadStore>,
    config: EngineConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("models", &self.selector.registry().len())
            .field("gateway", &self.gateway)
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator with default [`EngineConfig`].
    pub fn new(
        selector: ModelSelector,
        gateway: ProviderGateway,
        store: Arc<dyn ThreadStore>,
    ) -> Self {
        Self::with_config(selector, gateway, store, EngineConfig::default())
    }

    /// Orchestrator with explicit timing and retention.
    pub fn with_config(
        selector: ModelSelector,
        gateway: ProviderGateway,
        store: Arc<dyn ThreadStore>,
        config: EngineConfig,
    ) -> Self {
        let gateway = Arc::new(gateway);
        Self {
            extractor: FeatureExtractor::new(),
            selector: Arc::new(selector),
            collector: CritiqueCollector::new(Arc::clone(&gateway), config.critique),
            gateway,
            store,
            config,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load a thread snapshot from the store.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] if the store fails or has no such thread.
    pub async fn load_thread(&self, id: Uuid) -> Result<ConversationThread, OrchestratorError> {
        Ok(self.store.load_snapshot(id).await?)
    }

    /// Run one prompt to a terminal status.
    ///
    /// # Errors
    ///
    /// Only input problems are errors: [`OrchestratorError::EmptyPrompt`],
    /// [`OrchestratorError::InvalidPolicy`], or [`OrchestratorError::ConfigError`]
    /// for an empty registry. Provider failures end the thread in `FAILED`
    /// and are reported through [`OrchestrationResult::error`].
    pub async fn orchestrate(
        &self,
        prompt: &str,
        policy: OrchestrationPolicy,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        self.orchestrate_with_cancel(prompt, policy, &CancelHandle::new())
            .await
    }

    /// Like [`orchestrate`](Self::orchestrate), stopping at the next transition
    /// boundary once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Same as [`orchestrate`](Self::orchestrate).
    pub async fn orchestrate_with_cancel(
        &self,
        prompt: &str,
        policy: OrchestrationPolicy,
        cancel: &CancelHandle,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }
        policy.validate()?;

        let features = self.extractor.extract(prompt);
        let selection = self
            .selector
            .select(prompt, features)
            .ok_or_else(|| OrchestratorError::ConfigError("model registry is empty".to_string()))?;

        let thread = ConversationThread::new(prompt, selection.features.domain.clone(), policy);
        let span = info_span!("thread", thread_id = %thread.id);
        self.run(thread, selection, cancel).instrument(span).await
    }

    /// Run several independent prompts, at most `concurrency` at a time.
    ///
    /// Results come back in input order. Threads share nothing but the
    /// credential pools, so one prompt's failure never affects another.
    pub async fn orchestrate_batch<I, S>(
        &self,
        prompts: I,
        policy: OrchestrationPolicy,
        concurrency: usize,
    ) -> Vec<Result<OrchestrationResult, OrchestratorError>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        stream::iter(prompts)
            .map(|prompt| async move { self.orchestrate(prompt.as_ref(), policy).await })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    async fn run(
        &self,
        mut thread: ConversationThread,
        initial: SelectionResult,
        cancel: &CancelHandle,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let mut warnings = Vec::new();
        if initial.degraded {
            warnings.push(OrchestratorError::SelectionDegraded);
        }
        thread.primary_model = Some(initial.selected.clone());
        info!(
            domain = %thread.domain,
            primary = %initial.selected,
            confidence = initial.confidence,
            "thread created"
        );
        self.save(&thread).await;

        let mut selection = initial.clone();
        let mut prompt = thread.prompt.clone();
        let mut critiques: Vec<Critique> = Vec::new();
        let mut error = None;

        loop {
            if cancel.is_cancelled() {
                self.advance(&mut thread, ThreadStatus::Stopped).await?;
                break;
            }

            self.advance(&mut thread, ThreadStatus::Responding).await?;
            if thread.current_iteration > 1 && self.config.retention == ModelRetention::Reselect {
                if let Some(next) = self.selector.select(&prompt, self.extractor.extract(&prompt)) {
                    info!(from = %selection.selected, to = %next.selected, "primary model reselected");
                    selection = next;
                    thread.primary_model = Some(selection.selected.clone());
                }
            }

            let Some(profile) = self.selector.registry().get(&selection.selected).cloned() else {
                return Err(OrchestratorError::ConfigError(format!(
                    "selected model '{}' is not registered",
                    selection.selected
                )));
            };

            let traced = self
                .gateway
                .generate_traced(
                    &profile.provider,
                    &profile.model_id,
                    &prompt,
                    self.config.primary_timeout,
                )
                .await;
            thread.attempts.extend(traced.attempts);

            let generation = match traced.result {
                Ok(g) => g,
                Err(e) => {
                    warn!(model = %profile.id, error = %e, "primary generation failed");
                    thread.error = Some(e.to_string());
                    error = Some(e);
                    self.advance(&mut thread, ThreadStatus::Failed).await?;
                    break;
                }
            };

            let iteration = thread.current_iteration;
            thread
                .cost
                .charge(&profile.id, iteration, generation.tokens, profile.cost_per_1k_tokens);
            thread.record_response(profile.id.clone(), generation.text.clone());

            if thread.cost_limit_reached() {
                warnings.push(self.cost_warning(&thread));
                self.advance(&mut thread, ThreadStatus::Stopped).await?;
                break;
            }
            if cancel.is_cancelled() {
                self.advance(&mut thread, ThreadStatus::Stopped).await?;
                break;
            }

            self.advance(&mut thread, ThreadStatus::Evaluating).await?;
            let targets = self.critique_targets(&selection);
            let batch = self
                .collector
                .collect(&thread.prompt, &generation.text, &targets)
                .await;
            thread.attempts.extend(batch.attempts);
            for c in &batch.critiques {
                let rate = self
                    .selector
                    .registry()
                    .get(&c.model)
                    .map_or(0.0, |p| p.cost_per_1k_tokens);
                thread.cost.charge(&c.model, iteration, c.tokens, rate);
            }

            let QualityEstimate { score, source, .. } =
                quality::estimate(&batch.critiques, selection.confidence);
            thread.score_latest(score);
            critiques = batch.critiques;
            info!(
                iteration,
                quality = score,
                source = ?source,
                critiques = critiques.len(),
                cost = thread.total_cost(),
                "response evaluated"
            );

            if thread.cost_limit_reached() {
                warnings.push(self.cost_warning(&thread));
                self.advance(&mut thread, ThreadStatus::Stopped).await?;
                break;
            }
            if score >= thread.policy.quality_threshold
                || thread.current_iteration >= thread.policy.max_iterations
            {
                self.advance(&mut thread, ThreadStatus::Completed).await?;
                break;
            }
            if cancel.is_cancelled() {
                self.advance(&mut thread, ThreadStatus::Stopped).await?;
                break;
            }

            self.advance(&mut thread, ThreadStatus::Iterating).await?;
            prompt = refinement_prompt(&thread.prompt, &generation.text, &critiques);
        }

        metrics::inc_thread(&thread.status.as_str().to_lowercase());
        let answer = thread.answer().cloned();
        Ok(OrchestrationResult {
            thread_id: thread.id,
            status: thread.status,
            response: answer.as_ref().map(|r| r.text.clone()),
            primary_model: answer.as_ref().map(|r| r.model.clone()),
            critiques,
            quality: answer.and_then(|r| r.quality),
            iterations: thread.current_iteration,
            total_cost: thread.total_cost(),
            selection: initial,
            warnings,
            error,
            thread,
        })
    }

    fn critique_targets(&self, selection: &SelectionResult) -> Vec<CritiqueTarget> {
        selection
            .critique_targets()
            .into_iter()
            .filter_map(|id| {
                self.selector.registry().get(&id).map(|p| CritiqueTarget {
                    model: p.id.clone(),
                    provider: p.provider.clone(),
                    model_id: p.model_id.clone(),
                })
            })
            .collect()
    }

    fn cost_warning(&self, thread: &ConversationThread) -> OrchestratorError {
        let spent = thread.total_cost();
        let limit = thread.policy.cost_limit.unwrap_or_default();
        warn!(spent, limit, "cost limit reached, stopping thread");
        OrchestratorError::CostLimitExceeded { spent, limit }
    }

    async fn advance(
        &self,
        thread: &mut ConversationThread,
        to: ThreadStatus,
    ) -> Result<(), OrchestratorError> {
        let from = thread.status;
        thread.transition(to)?;
        info!(
            from = %from,
            to = %to,
            iteration = thread.current_iteration,
            "thread transition"
        );
        self.save(thread).await;
        Ok(())
    }

    async fn save(&self, thread: &ConversationThread) {
        if let Err(e) = self.store.save_snapshot(thread).await {
            warn!(error = %e, status = %thread.status, "snapshot save failed");
        }
    }
}
