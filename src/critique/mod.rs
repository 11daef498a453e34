//! # Stage: Critique Collection
//!
//! ## Responsibility
//! Ask every non-primary model, concurrently, to critique the primary
//! response along a rotating focus dimension, and gather whatever arrives
//! before a batch deadline.
//!
//! ## Guarantees
//! - Concurrent: one task per target; at most `targets.len()` calls in flight.
//! - Deadline-bound: returns when all calls settle or the deadline passes,
//!   whichever comes first. Stragglers are detached, not aborted, including
//!   when the caller drops the collection future.
//! - Advisory: failures and timeouts are recorded, never returned as errors.
//! - Ordered: results are re-sorted by selection rank before returning.
//!
//! ## NOT Responsible For
//! - Turning critiques into a quality score (that belongs to `engine::quality`)
//! - Deciding whether to iterate (that belongs to `engine`)

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::gateway::{GenerationAttempt, ProviderGateway, TracedGeneration};
use crate::metrics;

/// Aspect a critique is asked to concentrate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusDimension {
    /// Factual correctness.
    Accuracy,
    /// Soundness of the reasoning.
    Logic,
    /// Technical soundness.
    Technical,
    /// Originality.
    Creativity,
    /// Readability and structure.
    Clarity,
    /// Thoroughness.
    Depth,
}

impl FocusDimension {
    /// Rotation order.
    pub const ALL: [FocusDimension; 6] = [
        Self::Accuracy,
        Self::Logic,
        Self::Technical,
        Self::Creativity,
        Self::Clarity,
        Self::Depth,
    ];

    /// Focus for the critique at `position` in the target list.
    pub fn for_position(position: usize) -> Self {
        Self::ALL[position % Self::ALL.len()]
    }

    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Logic => "logic",
            Self::Technical => "technical",
            Self::Creativity => "creativity",
            Self::Clarity => "clarity",
            Self::Depth => "depth",
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            Self::Accuracy => "point out factual errors or unsupported claims",
            Self::Logic => "check whether each step of the reasoning follows",
            Self::Technical => "check technical correctness, edge cases and best practice",
            Self::Creativity => "suggest more original or insightful angles",
            Self::Clarity => "flag anything confusing, verbose or badly structured",
            Self::Depth => "identify what is missing or treated too shallowly",
        }
    }
}

impl std::fmt::Display for FocusDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the critique request sent to a reviewing model.
pub fn critique_prompt(original_prompt: &str, response: &str, focus: FocusDimension) -> String {
    format!(
        "You are reviewing another assistant's answer.\n\n\
         Original request:\n{original_prompt}\n\n\
         Answer under review:\n{response}\n\n\
         Focus on {focus}: {}.\n\
         List concrete problems and improvements, most important first.\n\
         Finish with a single line of the form \"Rating: N/10\".",
        focus.instruction()
    )
}

/// A model to ask for a critique.
#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueTarget {
    /// Registry id.
    pub model: String,
    /// Provider serving the model.
    pub provider: String,
    /// Upstream model identifier.
    pub model_id: String,
}

/// One collected critique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    /// Registry id of the reviewing model.
    pub model: String,
    /// Position in the target list (0 = most confident dissent).
    pub rank: usize,
    /// Focus the reviewer was asked for.
    pub focus: FocusDimension,
    /// Critique text.
    pub text: String,
    /// Tokens consumed.
    pub tokens: u64,
    /// Latency of the successful call in milliseconds.
    pub latency_ms: u64,
}

/// A reviewer that answered with an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueFailure {
    /// Registry id of the reviewing model.
    pub model: String,
    /// Error description.
    pub error: String,
}

/// Everything the collector saw before returning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueBatch {
    /// Collected critiques, sorted by rank.
    pub critiques: Vec<Critique>,
    /// Reviewers that failed.
    pub failures: Vec<CritiqueFailure>,
    /// Reviewers still running at the deadline.
    pub timed_out: Vec<String>,
    /// Every settled gateway attempt, in settle order.
    pub attempts: Vec<GenerationAttempt>,
}

impl CritiqueBatch {
    /// Whether no critique was collected.
    pub fn is_empty(&self) -> bool {
        self.critiques.is_empty()
    }
}

/// Timing for one critique round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CritiqueConfig {
    /// Batch deadline. Default: 10 s.
    pub deadline: Duration,
    /// Per-call timeout. Default: 10 s.
    pub call_timeout: Duration,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Fans critique requests out through a [`ProviderGateway`].
#[derive(Debug, Clone)]
pub struct CritiqueCollector {
    gateway: Arc<ProviderGateway>,
    config: CritiqueConfig,
}

type Settled = (usize, FocusDimension, TracedGeneration);

impl CritiqueCollector {
    /// Collector using a shared gateway.
    pub fn new(gateway: Arc<ProviderGateway>, config: CritiqueConfig) -> Self {
        Self { gateway, config }
    }

    /// Critique `response` with every target, concurrently, under the deadline.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn collect(
        &self,
        original_prompt: &str,
        response: &str,
        targets: &[CritiqueTarget],
    ) -> CritiqueBatch {
        let deadline = Instant::now() + self.config.deadline;
        // Dropping a JoinHandle detaches its task, so an abandoned collection
        // never cancels a call that is already upstream.
        let mut pending: FuturesUnordered<JoinHandle<Settled>> = FuturesUnordered::new();

        for (rank, target) in targets.iter().enumerate() {
            let focus = FocusDimension::for_position(rank);
            let prompt = critique_prompt(original_prompt, response, focus);
            let gateway = Arc::clone(&self.gateway);
            let provider = target.provider.clone();
            let model_id = target.model_id.clone();
            let timeout = self.config.call_timeout;
            pending.push(tokio::spawn(async move {
                let traced = gateway
                    .generate_traced(&provider, &model_id, &prompt, timeout)
                    .await;
                (rank, focus, traced)
            }));
        }

        let mut batch = CritiqueBatch::default();
        let mut settled = vec![false; targets.len()];

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(Ok((rank, focus, traced)))) => {
                    settled[rank] = true;
                    let model = targets[rank].model.clone();
                    record(&mut batch, model, rank, focus, traced);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "critique task ended abnormally");
                }
                Ok(None) => break,
                // Stop waiting; in-flight calls finish or hit their own timeout.
                Err(_) => break,
            }
        }

        for (rank, done) in settled.iter().enumerate() {
            if *done {
                continue;
            }
            let model = targets[rank].model.clone();
            if Instant::now() >= deadline {
                warn!(model = %model, "critique missed the deadline");
                metrics::inc_critique("timed_out");
                batch.timed_out.push(model);
            } else {
                metrics::inc_critique("failed");
                batch.failures.push(CritiqueFailure {
                    model,
                    error: "critique task aborted".to_string(),
                });
            }
        }

        batch.critiques.sort_by_key(|c| c.rank);
        info!(
            requested = targets.len(),
            collected = batch.critiques.len(),
            failed = batch.failures.len(),
            timed_out = batch.timed_out.len(),
            "critique round finished"
        );
        batch
    }
}

fn record(
    batch: &mut CritiqueBatch,
    model: String,
    rank: usize,
    focus: FocusDimension,
    traced: TracedGeneration,
) {
    let latency_ms = traced.attempts.last().map_or(0, |a| a.latency_ms);
    batch.attempts.extend(traced.attempts);
    match traced.result {
        Ok(generation) => {
            debug!(model = %model, rank, %focus, "critique collected");
            metrics::inc_critique("collected");
            batch.critiques.push(Critique {
                model,
                rank,
                focus,
                text: generation.text,
                tokens: generation.tokens,
                latency_ms,
            });
        }
        Err(e) => {
            warn!(model = %model, error = %e, "critique failed");
            metrics::inc_critique("failed");
            batch.failures.push(CritiqueFailure {
                model,
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{BackoffPolicy, CredentialPool, CredentialPools};
    use crate::gateway::{
        BackendError, BackendRequest, FailureKind, Generation, ProviderBackend,
    };
    use async_trait::async_trait;

    struct Timed {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl ProviderBackend for Timed {
        async fn generate(&self, request: &BackendRequest) -> Result<Generation, BackendError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(BackendError::new(FailureKind::ContentPolicy, "no"));
            }
            Ok(Generation {
                text: format!("{} says Rating: 7/10", request.model_id),
                tokens: 3,
            })
        }
    }

    fn setup(specs: &[(&str, u64, bool)]) -> (CritiqueCollector, Vec<CritiqueTarget>) {
        let mut pools = CredentialPools::new();
        let mut targets = Vec::new();
        for (name, _, _) in specs {
            pools.insert(CredentialPool::new(*name, BackoffPolicy::default()).with_key("k", None));
            targets.push(CritiqueTarget {
                model: name.to_string(),
                provider: name.to_string(),
                model_id: name.to_string(),
            });
        }
        let mut gateway = ProviderGateway::new(pools);
        for (name, delay_ms, fail) in specs {
            gateway = gateway.with_backend(
                *name,
                Arc::new(Timed {
                    delay: Duration::from_millis(*delay_ms),
                    fail: *fail,
                }),
            );
        }
        let collector = CritiqueCollector::new(
            Arc::new(gateway),
            CritiqueConfig {
                deadline: Duration::from_millis(500),
                call_timeout: Duration::from_secs(30),
            },
        );
        (collector, targets)
    }

    #[test]
    fn test_focus_rotates_by_position() {
        assert_eq!(FocusDimension::for_position(0), FocusDimension::Accuracy);
        assert_eq!(FocusDimension::for_position(5), FocusDimension::Depth);
        assert_eq!(FocusDimension::for_position(6), FocusDimension::Accuracy);
    }

    #[test]
    fn test_critique_prompt_mentions_focus_and_rating() {
        let p = critique_prompt("sort it", "sorted()", FocusDimension::Technical);
        assert!(p.contains("sort it"));
        assert!(p.contains("sorted()"));
        assert!(p.contains("technical"));
        assert!(p.contains("Rating: N/10"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_sorted_by_rank_despite_completion_order() {
        let (collector, targets) = setup(&[("a", 300, false), ("b", 200, false), ("c", 100, false)]);
        let batch = collector.collect("q", "answer", &targets).await;
        let models: Vec<_> = batch.critiques.iter().map(|c| c.model.as_str()).collect();
        assert_eq!(models, vec!["a", "b", "c"]);
        assert_eq!(batch.critiques[1].focus, FocusDimension::Logic);
        assert!(batch.timed_out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_model_excluded_and_returns_at_deadline() {
        let (collector, targets) = setup(&[("fast", 50, false), ("slow", 5_000, false)]);
        let start = Instant::now();
        let batch = collector.collect("q", "answer", &targets).await;
        let elapsed = start.elapsed();

        assert_eq!(batch.critiques.len(), 1);
        assert_eq!(batch.critiques[0].model, "fast");
        assert_eq!(batch.timed_out, vec!["slow".to_string()]);
        assert!(elapsed < Duration::from_millis(550), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_model_is_omitted_not_fatal() {
        let (collector, targets) = setup(&[("ok", 10, false), ("bad", 10, true)]);
        let batch = collector.collect("q", "answer", &targets).await;
        assert_eq!(batch.critiques.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].model, "bad");
        assert_eq!(batch.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_no_targets_returns_empty_batch() {
        let (collector, _) = setup(&[]);
        let batch = collector.collect("q", "answer", &[]).await;
        assert!(batch.is_empty());
        assert!(batch.failures.is_empty());
    }

    struct Counting {
        finished: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl ProviderBackend for Counting {
        async fn generate(&self, _request: &BackendRequest) -> Result<Generation, BackendError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Generation {
                text: "Rating: 8/10".into(),
                tokens: 2,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_collection_leaves_calls_running() {
        let finished = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pools = CredentialPools::new()
            .with_pool(CredentialPool::new("c", BackoffPolicy::default()).with_key("k", None));
        let gateway = Arc::new(ProviderGateway::new(pools).with_backend(
            "c",
            Arc::new(Counting {
                finished: Arc::clone(&finished),
            }),
        ));
        let collector = CritiqueCollector::new(Arc::clone(&gateway), CritiqueConfig::default());
        let targets = vec![CritiqueTarget {
            model: "c".into(),
            provider: "c".into(),
            model_id: "c".into(),
        }];

        let dropped =
            tokio::time::timeout(Duration::from_millis(20), collector.collect("q", "a", &targets))
                .await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(finished.load(std::sync::atomic::Ordering::SeqCst), 1);
        let pool = gateway.pools().get("c").expect("test: pool");
        assert_eq!(pool.status()[0].health, crate::credentials::HealthState::Healthy);
    }
}

