//! # Stage: Provider Gateway
//!
//! ## Responsibility
//! Issue one generation against one provider using a leased credential,
//! classify the outcome, and apply the two-tier retry: at most one swap to a
//! different credential of the same provider on a retryable failure.
//!
//! ## Guarantees
//! - Bounded: at most two backend calls per [`ProviderGateway::generate`].
//! - Fair to keys: only retryable failures penalise the credential; fatal
//!   rejections release it untouched.
//! - Timed: every backend call runs under the caller-supplied timeout. On
//!   expiry the gateway stops waiting; it does not attempt remote abort.
//! - Total: every failure path ends in a classified [`OrchestratorError`].
//!
//! ## NOT Responsible For
//! - Provider wire formats (see [`http`] and [`echo`])
//! - Choosing which model to call (that belongs to `selection`)

pub mod echo;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::credentials::{ApiKey, CredentialLease, CredentialOutcome, CredentialPools};
use crate::{metrics, OrchestratorError};

pub use echo::EchoBackend;
pub use http::{AnthropicBackend, OpenAiCompatibleBackend};

/// Classified failure of one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The call exceeded its timeout.
    Timeout,
    /// Upstream returned 5xx.
    ServerError,
    /// Upstream signalled a rate limit (429 or equivalent).
    RateLimited,
    /// Upstream rejected the key (401/403).
    Authentication,
    /// Connection-level failure before a response arrived.
    Transport,
    /// Upstream rejected the request body.
    MalformedRequest,
    /// Upstream does not serve the requested model.
    UnsupportedModel,
    /// Upstream refused on content-policy grounds.
    ContentPolicy,
}

impl FailureKind {
    /// Whether swapping to a different credential may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ServerError
                | Self::RateLimited
                | Self::Authentication
                | Self::Transport
        )
    }

    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::Authentication => "authentication",
            Self::Transport => "transport",
            Self::MalformedRequest => "malformed_request",
            Self::UnsupportedModel => "unsupported_model",
            Self::ContentPolicy => "content_policy",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a [`ProviderBackend`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    /// Classification driving the retry decision.
    pub kind: FailureKind,
    /// Upstream detail.
    pub message: String,
}

impl BackendError {
    /// Build an error of a given kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Everything a backend needs for one call.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Provider name.
    pub provider: String,
    /// Upstream model identifier.
    pub model_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Leased key.
    pub api_key: ApiKey,
    /// Per-call timeout; HTTP backends also apply it to the client request.
    pub timeout: Duration,
}

/// Successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// Generated text.
    pub text: String,
    /// Tokens consumed (prompt plus completion).
    pub tokens: u64,
}

/// One upstream text-generation API.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn ProviderBackend>`.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Send the prompt, return text and token usage or a classified failure.
    async fn generate(&self, request: &BackendRequest) -> Result<Generation, BackendError>;
}

/// Rough token estimate for backends that do not report usage.
pub fn estimate_tokens(prompt: &str, completion: &str) -> u64 {
    (prompt.split_whitespace().count() + completion.split_whitespace().count()) as u64
}

/// Outcome of one [`GenerationAttempt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Text and token usage.
    Success {
        /// Generated text.
        text: String,
        /// Tokens consumed.
        tokens: u64,
    },
    /// Classified failure.
    Failure {
        /// Failure classification.
        kind: FailureKind,
        /// Upstream detail.
        message: String,
    },
}

/// One request/response pair against one credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    /// Provider name.
    pub provider: String,
    /// Model identifier sent upstream.
    pub model_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Success or classified failure.
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// Index of the credential used.
    pub credential_index: usize,
    /// When the call was issued.
    pub started_at: DateTime<Utc>,
}

impl GenerationAttempt {
    /// Whether the attempt produced text.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }
}

/// A gateway result together with every attempt it took.
#[derive(Debug, Clone)]
pub struct TracedGeneration {
    /// Final result after retries.
    pub result: Result<Generation, OrchestratorError>,
    /// Attempts in issue order (zero, one or two).
    pub attempts: Vec<GenerationAttempt>,
}

/// Issues generations against registered backends with credential rotation.
#[derive(Clone, Default)]
pub struct ProviderGateway {
    pools: CredentialPools,
    backends: HashMap<String, Arc<dyn ProviderBackend>>,
}

impl fmt::Debug for ProviderGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<&String> = self.backends.keys().collect();
        providers.sort();
        f.debug_struct("ProviderGateway")
            .field("pools", &self.pools)
            .field("backends", &providers)
            .finish()
    }
}

impl ProviderGateway {
    /// Gateway over a set of credential pools with no backends yet.
    pub fn new(pools: CredentialPools) -> Self {
        Self {
            pools,
            backends: HashMap::new(),
        }
    }

    /// Register the backend serving a provider.
    pub fn with_backend(
        mut self,
        provider: impl Into<String>,
        backend: Arc<dyn ProviderBackend>,
    ) -> Self {
        self.backends.insert(provider.into(), backend);
        self
    }

    /// Credential pools in use.
    pub fn pools(&self) -> &CredentialPools {
        &self.pools
    }

    /// Generate text, discarding the attempt log.
    ///
    /// # Errors
    ///
    /// See [`generate_traced`](Self::generate_traced).
    pub async fn generate(
        &self,
        provider: &str,
        model_id: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Generation, OrchestratorError> {
        self.generate_traced(provider, model_id, prompt, timeout)
            .await
            .result
    }

    /// Generate text and return every attempt made.
    ///
    /// The result is an error when:
    /// - the provider has no keys or no backend: [`OrchestratorError::NoCredentialAvailable`]
    ///   or [`OrchestratorError::ConfigError`];
    /// - every key is resting before the first call: [`OrchestratorError::PoolExhausted`];
    /// - a retryable failure survives one credential swap, or no other key
    ///   is available for the swap: [`OrchestratorError::ProviderUnavailable`];
    /// - upstream rejects the request: [`OrchestratorError::ProviderRejected`].
    pub async fn generate_traced(
        &self,
        provider: &str,
        model_id: &str,
        prompt: &str,
        timeout: Duration,
    ) -> TracedGeneration {
        let mut attempts = Vec::new();
        let result = self
            .run(provider, model_id, prompt, timeout, &mut attempts)
            .await;
        TracedGeneration { result, attempts }
    }

    async fn run(
        &self,
        provider: &str,
        model_id: &str,
        prompt: &str,
        timeout: Duration,
        attempts: &mut Vec<GenerationAttempt>,
    ) -> Result<Generation, OrchestratorError> {
        let pool = self.pools.get(provider)?;
        let backend = self.backends.get(provider).ok_or_else(|| {
            OrchestratorError::ConfigError(format!("no backend registered for provider '{provider}'"))
        })?;

        let mut lease = pool.acquire()?;
        let mut swapped = false;

        loop {
            let attempt = call_once(backend.as_ref(), &lease, model_id, prompt, timeout).await;
            let outcome = attempt.outcome.clone();
            attempts.push(attempt);

            match outcome {
                AttemptOutcome::Success { text, tokens } => {
                    pool.report_outcome(&lease, CredentialOutcome::Success);
                    return Ok(Generation { text, tokens });
                }
                AttemptOutcome::Failure { kind, message } if !kind.is_retryable() => {
                    pool.report_outcome(&lease, CredentialOutcome::Released);
                    warn!(provider, model_id, %kind, error = %message, "provider rejected request");
                    return Err(OrchestratorError::ProviderRejected {
                        provider: provider.to_string(),
                        kind,
                        reason: message,
                    });
                }
                AttemptOutcome::Failure { kind, message } => {
                    pool.report_outcome(&lease, CredentialOutcome::Failure);
                    let reason = format!("{kind}: {message}");
                    if swapped {
                        warn!(provider, model_id, %reason, "retry with second credential failed");
                        return Err(OrchestratorError::ProviderUnavailable {
                            provider: provider.to_string(),
                            reason,
                        });
                    }
                    match pool.acquire_excluding(&[lease.index]) {
                        Ok(next) => {
                            warn!(
                                provider,
                                model_id,
                                %reason,
                                from = lease.index,
                                to = next.index,
                                "retrying with a different credential"
                            );
                            lease = next;
                            swapped = true;
                        }
                        Err(_) => {
                            warn!(provider, model_id, %reason, "no spare credential for retry");
                            return Err(OrchestratorError::ProviderUnavailable {
                                provider: provider.to_string(),
                                reason,
                            });
                        }
                    }
                }
            }
        }
    }
}

async fn call_once(
    backend: &dyn ProviderBackend,
    lease: &CredentialLease,
    model_id: &str,
    prompt: &str,
    timeout: Duration,
) -> GenerationAttempt {
    let model_id = lease.model.as_deref().unwrap_or(model_id).to_string();
    let request = BackendRequest {
        provider: lease.provider.clone(),
        model_id: model_id.clone(),
        prompt: prompt.to_string(),
        api_key: lease.key.clone(),
        timeout,
    };

    let started_at = Utc::now();
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, backend.generate(&request)).await {
        Ok(r) => r,
        Err(_) => Err(BackendError::new(
            FailureKind::Timeout,
            format!("no response within {}ms", timeout.as_millis()),
        )),
    };
    let latency = start.elapsed();

    let outcome = match result {
        Ok(g) => AttemptOutcome::Success {
            text: g.text,
            tokens: g.tokens,
        },
        Err(e) => AttemptOutcome::Failure {
            kind: e.kind,
            message: e.message,
        },
    };
    let label = match &outcome {
        AttemptOutcome::Success { .. } => "success",
        AttemptOutcome::Failure { kind, .. } => kind.as_str(),
    };
    metrics::record_provider_request(&lease.provider, label, latency);
    debug!(
        provider = %lease.provider,
        model_id = %model_id,
        credential = lease.index,
        outcome = label,
        latency_ms = latency.as_millis() as u64,
        "backend call finished"
    );

    GenerationAttempt {
        provider: lease.provider.clone(),
        model_id,
        prompt: request.prompt,
        outcome,
        latency_ms: latency.as_millis() as u64,
        credential_index: lease.index,
        started_at,
    }
}
