//! # Stage: Declarative Engine Configuration
//!
//! ## Responsibility
//! Parse and validate a TOML document describing the engine: default
//! policy, timeouts, selection knobs, credential backoff, providers with
//! their keys, and an optional model registry. Turn a validated document
//! into a ready [`Orchestrator`].
//!
//! ```text
//! critique-orchestrator --config orchestrator.toml "Write a haiku about Rust"
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Secret-aware: `key_env` references are resolved at load time and a
//!   missing variable is reported by name, never by value
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Running orchestrations (that belongs to `engine`)
//! - Installing the tracing subscriber (that belongs to [`crate::init_tracing`])

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::{BackoffPolicy, CredentialPool, CredentialPools};
use crate::critique::CritiqueConfig;
use crate::engine::{EngineConfig, ModelRetention, OrchestrationPolicy, Orchestrator, ThreadStore};
use crate::gateway::{AnthropicBackend, EchoBackend, OpenAiCompatibleBackend, ProviderBackend, ProviderGateway};
use crate::selection::{ModelProfile, ModelRegistry, ModelSelector, SelectorConfig};
use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

fn default_name() -> String {
    "critique-orchestrator".to_string()
}

fn default_max_iterations() -> u32 {
    3
}

fn default_quality_threshold() -> f64 {
    0.8
}

/// Default primary call timeout: 30 000 ms.
fn default_primary_timeout_ms() -> u64 {
    30_000
}

/// Default per-critique call timeout: 10 000 ms.
fn default_critique_timeout_ms() -> u64 {
    10_000
}

/// Default critique batch deadline: 10 000 ms.
fn default_critique_deadline_ms() -> u64 {
    10_000
}

fn default_keyword_weight() -> f64 {
    0.05
}

fn default_jitter() -> f64 {
    0.02
}

/// Default first cooldown: 30 s.
fn default_backoff_base_s() -> u64 {
    30
}

/// Default longest cooldown: 30 min.
fn default_backoff_cap_s() -> u64 {
    1800
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an engine instance.
///
/// Only `[[providers]]` is required; every other section has documented
/// defaults. An empty `[[models]]` list selects the built-in registry.
///
/// # Example
///
/// ```toml
/// [policy]
/// max_iterations = 2
/// quality_threshold = 0.85
///
/// [[providers]]
/// name = "openai"
/// kind = "open_ai"
/// keys = [{ key_env = "OPENAI_API_KEY" }]
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Instance identity.
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Default per-thread policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Call timeouts and critique deadline.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Model selection knobs.
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Credential cooldown backoff.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Upstream providers and their keys.
    pub providers: Vec<ProviderConfig>,
    /// Model registry override; empty means the built-in registry.
    #[serde(default)]
    pub models: Vec<ModelProfile>,
    /// Logging.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Instance identity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorSection {
    /// Human-readable instance name.
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

// ── Policy ───────────────────────────────────────────────────────────────

/// Default per-thread policy; callers may override per request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PolicyConfig {
    /// Maximum primary responses per thread. Must be ≥ 1.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Quality at which a thread completes, in `[0, 1]`.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Budget per thread in USD. `None` means unlimited.
    pub cost_limit: Option<f64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            cost_limit: None,
        }
    }
}

// ── Timeouts ─────────────────────────────────────────────────────────────

/// Call timeouts and the critique batch deadline, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TimeoutsConfig {
    /// Timeout for each primary call.
    #[serde(default = "default_primary_timeout_ms")]
    pub primary_timeout_ms: u64,
    /// Timeout for each critique call.
    #[serde(default = "default_critique_timeout_ms")]
    pub critique_timeout_ms: u64,
    /// Deadline for the whole critique batch.
    #[serde(default = "default_critique_deadline_ms")]
    pub critique_deadline_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            primary_timeout_ms: default_primary_timeout_ms(),
            critique_timeout_ms: default_critique_timeout_ms(),
            critique_deadline_ms: default_critique_deadline_ms(),
        }
    }
}

// ── Selection ────────────────────────────────────────────────────────────

/// Model selection knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SelectionConfig {
    /// Score increment per matched keyword of unit weight.
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// Half-width of the random jitter; `0` makes selection deterministic.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Whether refined prompts may switch the primary model.
    #[serde(default)]
    pub retention: RetentionKind,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            keyword_weight: default_keyword_weight(),
            jitter: default_jitter(),
            retention: RetentionKind::default(),
        }
    }
}

/// Primary model retention across iterations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    /// Keep the first selection.
    #[default]
    Fixed,
    /// Re-select on every refined prompt.
    Reselect,
}

// ── Credentials ──────────────────────────────────────────────────────────

/// Cooldown backoff applied to failing keys.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CredentialsConfig {
    /// First cooldown window in seconds. Must be ≤ `backoff_cap_s`.
    #[serde(default = "default_backoff_base_s")]
    pub backoff_base_s: u64,
    /// Longest cooldown window in seconds.
    #[serde(default = "default_backoff_cap_s")]
    pub backoff_cap_s: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backoff_base_s: default_backoff_base_s(),
            backoff_cap_s: default_backoff_cap_s(),
        }
    }
}

// ── Providers ────────────────────────────────────────────────────────────

/// Supported provider backends.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions (OpenAI, DeepSeek, Mistral, Groq, …).
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Echo backend for demos and tests.
    Echo,
}

/// One upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProviderConfig {
    /// Provider name referenced by `models[].provider`.
    pub name: String,
    /// Backend protocol.
    pub kind: ProviderKind,
    /// API root override.
    pub base_url: Option<String>,
    /// Maximum completion tokens. `None` uses the backend default.
    pub max_tokens: Option<u32>,
    /// Sampling temperature. `None` uses the backend default.
    pub temperature: Option<f32>,
    /// Keys, rotated round-robin.
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// One key. Exactly one of `key` or `key_env` must be set.
#[derive(Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct KeyConfig {
    /// Literal key material.
    pub key: Option<String>,
    /// Environment variable holding the key, resolved at load time.
    pub key_env: Option<String>,
    /// Model this key is pinned to.
    pub model: Option<String>,
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field("key", &self.key.as_ref().map(|_| "***"))
            .field("key_env", &self.key_env)
            .field("model", &self.model)
            .finish()
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Value understood by the `LOG_FORMAT` environment variable.
    pub fn as_env_value(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────

impl OrchestratorConfig {
    /// Every built-in model served by an echo backend with a placeholder key.
    pub fn echo_demo() -> Self {
        let providers = ModelRegistry::default_registry()
            .providers()
            .into_iter()
            .map(|name| ProviderConfig {
                name,
                kind: ProviderKind::Echo,
                base_url: None,
                max_tokens: None,
                temperature: None,
                keys: vec![KeyConfig {
                    key: Some("demo".to_string()),
                    key_env: None,
                    model: None,
                }],
            })
            .collect();
        Self {
            orchestrator: OrchestratorSection {
                name: "echo-demo".to_string(),
            },
            policy: PolicyConfig::default(),
            timeouts: TimeoutsConfig::default(),
            selection: SelectionConfig::default(),
            credentials: CredentialsConfig::default(),
            providers,
            models: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// Effective model registry.
    pub fn registry(&self) -> ModelRegistry {
        if self.models.is_empty() {
            ModelRegistry::default_registry()
        } else {
            ModelRegistry::new(self.models.clone())
        }
    }

    /// Default per-thread policy.
    pub fn policy(&self) -> OrchestrationPolicy {
        OrchestrationPolicy {
            max_iterations: self.policy.max_iterations,
            quality_threshold: self.policy.quality_threshold,
            cost_limit: self.policy.cost_limit,
        }
    }

    /// Selector knobs.
    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            keyword_weight: self.selection.keyword_weight,
            jitter: self.selection.jitter,
        }
    }

    /// Engine timing and retention.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            primary_timeout: Duration::from_millis(self.timeouts.primary_timeout_ms),
            critique: CritiqueConfig {
                deadline: Duration::from_millis(self.timeouts.critique_deadline_ms),
                call_timeout: Duration::from_millis(self.timeouts.critique_timeout_ms),
            },
            retention: match self.selection.retention {
                RetentionKind::Fixed => ModelRetention::Fixed,
                RetentionKind::Reselect => ModelRetention::Reselect,
            },
        }
    }

    /// Credential backoff.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.credentials.backoff_base_s),
            cap: Duration::from_secs(self.credentials.backoff_cap_s),
        }
    }

    /// Credential pools and backends for every provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] for a key whose material was
    /// never resolved (use [`loader`] to resolve `key_env` entries).
    pub fn build_gateway(&self) -> Result<ProviderGateway, ConfigError> {
        let mut pools = CredentialPools::new();
        let mut backends: Vec<(String, Arc<dyn ProviderBackend>)> = Vec::new();

        for (i, provider) in self.providers.iter().enumerate() {
            let pool = CredentialPool::new(provider.name.clone(), self.backoff());
            for (j, key) in provider.keys.iter().enumerate() {
                let Some(material) = key.key.as_ref() else {
                    return Err(ConfigError::MissingSecret {
                        field: format!("providers[{i}].keys[{j}]"),
                        var: key.key_env.clone().unwrap_or_default(),
                    });
                };
                pool.add_key(material.clone(), key.model.clone());
            }
            pools.insert(pool);
            backends.push((provider.name.clone(), backend_for(provider)));
        }

        let gateway = backends
            .into_iter()
            .fold(ProviderGateway::new(pools), |gw, (name, backend)| {
                gw.with_backend(name, backend)
            });
        Ok(gateway)
    }

    /// A ready orchestrator persisting to `store`.
    ///
    /// # Errors
    ///
    /// Same as [`build_gateway`](Self::build_gateway).
    pub fn build_orchestrator(
        &self,
        store: Arc<dyn ThreadStore>,
    ) -> Result<Orchestrator, ConfigError> {
        let selector = ModelSelector::new(self.registry(), self.selector_config());
        Ok(Orchestrator::with_config(
            selector,
            self.build_gateway()?,
            store,
            self.engine_config(),
        ))
    }
}

fn backend_for(provider: &ProviderConfig) -> Arc<dyn ProviderBackend> {
    match provider.kind {
        ProviderKind::OpenAi => {
            let mut b = OpenAiCompatibleBackend::new();
            if let Some(url) = &provider.base_url {
                b = b.with_base_url(url.clone());
            }
            if let Some(n) = provider.max_tokens {
                b = b.with_max_tokens(n);
            }
            if let Some(t) = provider.temperature {
                b = b.with_temperature(t);
            }
            Arc::new(b)
        }
        ProviderKind::Anthropic => {
            let mut b = AnthropicBackend::new();
            if let Some(url) = &provider.base_url {
                b = b.with_base_url(url.clone());
            }
            if let Some(n) = provider.max_tokens {
                b = b.with_max_tokens(n);
            }
            if let Some(t) = provider.temperature {
                b = b.with_temperature(t);
            }
            Arc::new(b)
        }
        ProviderKind::Echo => Arc::new(EchoBackend::new()),
    }
}

/// Export the JSON Schema for `OrchestratorConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}
