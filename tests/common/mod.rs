//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use critique_orchestrator::credentials::{BackoffPolicy, CredentialPool, CredentialPools};
use critique_orchestrator::engine::{EngineConfig, InMemoryThreadStore, Orchestrator, ThreadStore};
use critique_orchestrator::gateway::{BackendError, BackendRequest, FailureKind, Generation};
use critique_orchestrator::selection::{ModelRegistry, ModelSelector, SelectorConfig};
use critique_orchestrator::ProviderBackend;

/// Prefix of every critique prompt.
pub const CRITIQUE_MARKER: &str = "You are reviewing";

/// Behaviour of one provider in a test.
#[derive(Debug, Clone)]
pub struct Script {
    /// Primary answer, or a failure kind.
    pub primary: Result<String, FailureKind>,
    /// Critique text, or a failure kind.
    pub critique: Result<String, FailureKind>,
    /// Latency of every call.
    pub delay: Duration,
    /// Primary calls from this 1-based call number on fail with the kind.
    pub primary_fails_from: Option<(usize, FailureKind)>,
}

impl Script {
    pub fn rating(n: u32) -> Self {
        Self {
            primary: Ok("Here is a careful answer.".to_string()),
            critique: Ok(format!("The answer is mostly fine.\nRating: {n}/10")),
            delay: Duration::from_millis(5),
            primary_fails_from: None,
        }
    }

    pub fn failing_primary(mut self, kind: FailureKind) -> Self {
        self.primary = Err(kind);
        self
    }

    pub fn failing_critique(mut self, kind: FailureKind) -> Self {
        self.critique = Err(kind);
        self
    }

    pub fn failing_primary_from(mut self, call: usize, kind: FailureKind) -> Self {
        self.primary_fails_from = Some((call, kind));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Backend that answers according to a [`Script`] and records every prompt.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Script,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn primary_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .iter()
            .filter(|p| !p.starts_with(CRITIQUE_MARKER))
            .cloned()
            .collect()
    }

    pub fn critique_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .iter()
            .filter(|p| p.starts_with(CRITIQUE_MARKER))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProviderBackend for ScriptedBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<Generation, BackendError> {
        let primary_calls = {
            let mut prompts = self.prompts.lock();
            prompts.push(request.prompt.clone());
            prompts.iter().filter(|p| !p.starts_with(CRITIQUE_MARKER)).count()
        };
        tokio::time::sleep(self.script.delay).await;
        let reply = if request.prompt.starts_with(CRITIQUE_MARKER) {
            self.script.critique.clone()
        } else {
            match self.script.primary_fails_from {
                Some((from, kind)) if primary_calls >= from => Err(kind),
                _ => self.script.primary.clone(),
            }
        };
        match reply {
            Ok(text) => Ok(Generation {
                text: format!("[{}] {text}", request.model_id),
                tokens: 100,
            }),
            Err(kind) => Err(BackendError::new(kind, "scripted failure")),
        }
    }
}

/// Orchestrator over the built-in registry, one key per provider, no jitter.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub backends: HashMap<String, Arc<ScriptedBackend>>,
    pub pools: CredentialPools,
}

impl Harness {
    pub fn backend(&self, provider: &str) -> &ScriptedBackend {
        self.backends
            .get(provider)
            .map(Arc::as_ref)
            .expect("test: provider is registered")
    }
}

/// Build a harness where every provider follows `default`, except those in
/// `overrides`.
pub fn harness(
    default: Script,
    overrides: &[(&str, Script)],
    store: Arc<dyn ThreadStore>,
    config: EngineConfig,
) -> Harness {
    let registry = ModelRegistry::default_registry();
    let mut pools = CredentialPools::new();
    let mut backends = HashMap::new();
    for provider in registry.providers() {
        pools.insert(
            CredentialPool::new(provider.clone(), BackoffPolicy::default())
                .with_key(format!("key-{provider}"), None),
        );
        let script = overrides
            .iter()
            .find(|(p, _)| *p == provider)
            .map_or_else(|| default.clone(), |(_, s)| s.clone());
        backends.insert(provider, ScriptedBackend::new(script));
    }

    let gateway = backends.iter().fold(
        critique_orchestrator::ProviderGateway::new(pools.clone()),
        |gw, (name, backend)| {
            let backend: Arc<dyn ProviderBackend> = backend.clone();
            gw.with_backend(name.clone(), backend)
        },
    );
    let selector = ModelSelector::new(
        registry,
        SelectorConfig {
            jitter: 0.0,
            ..SelectorConfig::default()
        },
    );
    Harness {
        orchestrator: Orchestrator::with_config(selector, gateway, store, config),
        backends,
        pools,
    }
}

/// Harness with an in-memory store and default engine config.
pub fn simple(default: Script) -> Harness {
    harness(
        default,
        &[],
        Arc::new(InMemoryThreadStore::new()),
        EngineConfig::default(),
    )
}
