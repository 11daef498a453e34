//! # Stage: Credential Pool
//!
//! ## Responsibility
//! Hold each provider's ordered list of API keys, hand them out round-robin,
//! and track per-key health so that rate-limited or rejected keys rest for an
//! exponentially growing window before they are tried again.
//!
//! ## Guarantees
//! - Serialized: rotation pointer and health map live behind one
//!   per-provider mutex; callers only see [`CredentialLease`] copies.
//! - Drop-safe: a lease that is dropped without a reported outcome (a
//!   cancelled or timed-out caller) frees its in-flight slot on drop.
//! - Spread: rotation resumes after the last-used index, not at the head.
//! - Transient: no key is ever removed. Cooling and exhausted keys become
//!   eligible again once their window elapses.
//! - Bounded: backoff doubles from `base` up to `cap` and resets on success.
//!
//! ## NOT Responsible For
//! - Classifying upstream failures (that belongs to `gateway`)
//! - Loading key material (that belongs to `config`)

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::OrchestratorError;

/// Health of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Eligible for use.
    Healthy,
    /// Resting after a failure; eligible again at `until`.
    CoolingDown {
        /// End of the rest window.
        until: Instant,
    },
    /// Backoff has reached its cap; still retried at `until`.
    Exhausted {
        /// End of the rest window.
        until: Instant,
    },
}

impl HealthState {
    /// Whether the credential may be handed out at `now`.
    pub fn is_available(&self, now: Instant) -> bool {
        match self {
            Self::Healthy => true,
            Self::CoolingDown { until } | Self::Exhausted { until } => now >= *until,
        }
    }

    /// State as observed at `now`: an elapsed rest window reads as healthy.
    pub fn effective(self, now: Instant) -> Self {
        match self {
            Self::CoolingDown { until } | Self::Exhausted { until } if now >= until => {
                Self::Healthy
            }
            other => other,
        }
    }

    /// Short stable label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::CoolingDown { .. } => "cooling_down",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}

/// What the caller observed while using a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// The request succeeded: mark healthy, reset backoff.
    Success,
    /// Auth failure or rate-limit signal: start or extend cooldown.
    Failure,
    /// The request failed for reasons unrelated to the key: no health change.
    Released,
}

/// Exponential backoff window applied on [`CredentialOutcome::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// First cooldown window. Default: 30 s.
    pub base: Duration,
    /// Largest cooldown window. Default: 30 min.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Window after `failures` consecutive failures (`failures >= 1`).
    pub fn window(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1_u32 << shift)
            .map_or(self.cap, |w| w.min(self.cap))
    }
}

/// API key material. `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap raw key material.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

struct Credential {
    key: ApiKey,
    model: Option<String>,
    health: HealthState,
    consecutive_failures: u32,
    in_flight: Arc<AtomicU32>,
    last_used: Option<Instant>,
}

/// Holds one in-flight slot of a credential until settled or dropped.
#[derive(Debug)]
struct InFlightSlot {
    counter: Arc<AtomicU32>,
    settled: AtomicBool,
}

impl InFlightSlot {
    fn claim(counter: &Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
            settled: AtomicBool::new(false),
        }
    }

    /// Free the slot. Returns `false` if it was already freed.
    fn settle(&self) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.counter.fetch_sub(1, Ordering::AcqRel);
        true
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.settle();
    }
}

/// A handed-out credential. Report it back with
/// [`CredentialPool::report_outcome`]; dropping it unreported releases it
/// with no health change.
#[derive(Debug)]
pub struct CredentialLease {
    /// Provider the key belongs to.
    pub provider: String,
    /// Position in the provider's key list.
    pub index: usize,
    /// Key material.
    pub key: ApiKey,
    /// Model this key authorizes, when pinned.
    pub model: Option<String>,
    slot: InFlightSlot,
}

/// Read-only view of one credential, for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialStatus {
    /// Position in the provider's key list.
    pub index: usize,
    /// Current health.
    pub health: HealthState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Last time the key was handed out.
    pub last_used: Option<Instant>,
}

struct PoolState {
    credentials: Vec<Credential>,
    /// Index the next rotation starts from.
    cursor: usize,
}

/// Rotating key set for one provider.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct CredentialPool {
    provider: String,
    backoff: BackoffPolicy,
    state: Mutex<PoolState>,
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("provider", &self.provider)
            .field("keys", &self.len())
            .finish()
    }
}

impl CredentialPool {
    /// Empty pool for a provider.
    pub fn new(provider: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            provider: provider.into(),
            backoff,
            state: Mutex::new(PoolState {
                credentials: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Append a key, optionally pinned to a model.
    pub fn with_key(self, key: impl Into<String>, model: Option<String>) -> Self {
        self.add_key(key, model);
        self
    }

    /// Append a key to a shared pool.
    pub fn add_key(&self, key: impl Into<String>, model: Option<String>) {
        self.state.lock().credentials.push(Credential {
            key: ApiKey::new(key),
            model,
            health: HealthState::Healthy,
            consecutive_failures: 0,
            in_flight: Arc::new(AtomicU32::new(0)),
            last_used: None,
        });
    }

    /// Provider this pool serves.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.state.lock().credentials.len()
    }

    /// Whether no key is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the next available credential.
    ///
    /// Rotation starts after the last-used index. Idle keys are preferred over
    /// keys already leased to a concurrent caller.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::NoCredentialAvailable`] if the pool has no keys.
    /// - [`OrchestratorError::PoolExhausted`] if every key is resting.
    pub fn acquire(&self) -> Result<CredentialLease, OrchestratorError> {
        self.acquire_excluding(&[])
    }

    /// Like [`acquire`](Self::acquire), skipping the given indices.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire); excluded keys count as resting.
    pub fn acquire_excluding(
        &self,
        exclude: &[usize],
    ) -> Result<CredentialLease, OrchestratorError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let n = state.credentials.len();
        if n == 0 {
            return Err(OrchestratorError::NoCredentialAvailable {
                provider: self.provider.clone(),
            });
        }

        let eligible = |i: usize, c: &Credential| !exclude.contains(&i) && c.health.is_available(now);
        let order: Vec<usize> = (0..n).map(|k| (state.cursor + k) % n).collect();
        let pick = order
            .iter()
            .copied()
            .find(|&i| {
                let c = &state.credentials[i];
                eligible(i, c) && c.in_flight.load(Ordering::Acquire) == 0
            })
            .or_else(|| {
                order
                    .iter()
                    .copied()
                    .find(|&i| eligible(i, &state.credentials[i]))
            });

        let Some(index) = pick else {
            debug!(provider = %self.provider, "every credential is resting");
            return Err(OrchestratorError::PoolExhausted {
                provider: self.provider.clone(),
            });
        };

        state.cursor = (index + 1) % n;
        let cred = &mut state.credentials[index];
        cred.last_used = Some(now);
        Ok(CredentialLease {
            provider: self.provider.clone(),
            index,
            key: cred.key.clone(),
            model: cred.model.clone(),
            slot: InFlightSlot::claim(&cred.in_flight),
        })
    }

    /// Record what happened with a lease and update the key's health.
    ///
    /// Only the first report for a lease counts; later ones are ignored.
    pub fn report_outcome(&self, lease: &CredentialLease, outcome: CredentialOutcome) {
        if !lease.slot.settle() {
            debug!(provider = %self.provider, index = lease.index, "lease already settled");
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(cred) = state.credentials.get_mut(lease.index) else {
            return;
        };

        match outcome {
            CredentialOutcome::Success => {
                if cred.health != HealthState::Healthy {
                    info!(
                        provider = %self.provider,
                        index = lease.index,
                        "credential recovered"
                    );
                }
                cred.health = HealthState::Healthy;
                cred.consecutive_failures = 0;
            }
            CredentialOutcome::Failure => {
                cred.consecutive_failures = cred.consecutive_failures.saturating_add(1);
                let window = self.backoff.window(cred.consecutive_failures);
                let until = now + window;
                cred.health = if window >= self.backoff.cap {
                    HealthState::Exhausted { until }
                } else {
                    HealthState::CoolingDown { until }
                };
                warn!(
                    provider = %self.provider,
                    index = lease.index,
                    failures = cred.consecutive_failures,
                    cooldown_s = window.as_secs(),
                    state = cred.health.label(),
                    "credential cooling down"
                );
                crate::metrics::inc_cooldown(&self.provider);
            }
            CredentialOutcome::Released => {}
        }
    }

    /// Snapshot of every credential's health as of now.
    ///
    /// A key whose rest window has elapsed reads as [`HealthState::Healthy`]
    /// even before its next success; its failure count is kept.
    pub fn status(&self) -> Vec<CredentialStatus> {
        let now = Instant::now();
        self.state
            .lock()
            .credentials
            .iter()
            .enumerate()
            .map(|(index, c)| CredentialStatus {
                index,
                health: c.health.effective(now),
                consecutive_failures: c.consecutive_failures,
                last_used: c.last_used,
            })
            .collect()
    }
}

/// Provider name to [`CredentialPool`].
#[derive(Debug, Clone, Default)]
pub struct CredentialPools {
    pools: HashMap<String, Arc<CredentialPool>>,
}

impl CredentialPools {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under its provider name, replacing any previous one.
    pub fn insert(&mut self, pool: CredentialPool) {
        self.pools
            .insert(pool.provider().to_string(), Arc::new(pool));
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_pool(mut self, pool: CredentialPool) -> Self {
        self.insert(pool);
        self
    }

    /// Pool for a provider.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NoCredentialAvailable`] if the provider
    /// has no pool or the pool has no keys.
    pub fn get(&self, provider: &str) -> Result<Arc<CredentialPool>, OrchestratorError> {
        match self.pools.get(provider) {
            Some(pool) if !pool.is_empty() => Ok(Arc::clone(pool)),
            _ => Err(OrchestratorError::NoCredentialAvailable {
                provider: provider.to_string(),
            }),
        }
    }

    /// Registered provider names.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(keys: usize) -> CredentialPool {
        let p = CredentialPool::new("openai", BackoffPolicy::default());
        for i in 0..keys {
            p.add_key(format!("sk-{i}"), None);
        }
        p
    }

    fn fail(p: &CredentialPool) -> CredentialLease {
        let lease = p.acquire().expect("test: lease");
        p.report_outcome(&lease, CredentialOutcome::Failure);
        lease
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let b = BackoffPolicy::default();
        assert_eq!(b.window(1), Duration::from_secs(30));
        assert_eq!(b.window(2), Duration::from_secs(60));
        assert_eq!(b.window(3), Duration::from_secs(120));
        assert_eq!(b.window(7), Duration::from_secs(1800));
        assert_eq!(b.window(u32::MAX), Duration::from_secs(1800));
    }

    #[test]
    fn test_api_key_debug_is_redacted() {
        let key = ApiKey::new("sk-secret");
        assert!(!format!("{key:?}").contains("secret"));
        assert_eq!(key.expose(), "sk-secret");
    }

    #[tokio::test]
    async fn test_empty_pool_reports_no_credential() {
        let err = pool(0).acquire().expect_err("test: empty pool");
        assert!(matches!(err, OrchestratorError::NoCredentialAvailable { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_resumes_after_last_used() {
        let p = pool(3);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let lease = p.acquire().expect("test: lease");
            seen.push(lease.index);
            p.report_outcome(&lease, CredentialOutcome::Success);
        }
        assert_eq!(seen, vec![0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn test_concurrent_leases_get_distinct_keys() {
        let p = pool(2);
        let a = p.acquire().expect("test: lease a");
        let b = p.acquire().expect("test: lease b");
        assert_ne!(a.index, b.index);
    }

    #[tokio::test]
    async fn test_busy_single_key_is_shared_rather_than_refused() {
        let p = pool(1);
        let a = p.acquire().expect("test: lease a");
        let b = p.acquire().expect("test: lease b");
        assert_eq!(a.index, b.index);
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_failures_exhaust_pool_of_n() {
        let p = pool(3);
        for _ in 0..3 {
            fail(&p);
        }
        let err = p.acquire().expect_err("test: exhausted");
        assert!(matches!(err, OrchestratorError::PoolExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_returns_after_backoff_window() {
        let p = pool(2);
        fail(&p);
        fail(&p);
        assert!(p.acquire().is_err());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(p.acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let lease = p.acquire().expect("test: window elapsed");
        p.report_outcome(&lease, CredentialOutcome::Success);
        assert_eq!(p.status()[lease.index].health, HealthState::Healthy);
        assert_eq!(p.status()[lease.index].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_reach_exhausted_state() {
        let p = CredentialPool::new(
            "anthropic",
            BackoffPolicy {
                base: Duration::from_secs(30),
                cap: Duration::from_secs(60),
            },
        )
        .with_key("k", None);

        fail(&p);
        assert!(matches!(p.status()[0].health, HealthState::CoolingDown { .. }));

        tokio::time::advance(Duration::from_secs(30)).await;
        fail(&p);
        assert!(matches!(p.status()[0].health, HealthState::Exhausted { .. }));

        // Exhausted keys are retried once the capped window elapses.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(p.acquire().is_ok());
    }

    #[tokio::test]
    async fn test_released_outcome_leaves_health_untouched() {
        let p = pool(1);
        let lease = p.acquire().expect("test: lease");
        p.report_outcome(&lease, CredentialOutcome::Released);
        assert_eq!(p.status()[0].health, HealthState::Healthy);
        assert_eq!(p.status()[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_acquire_excluding_skips_given_index() {
        let p = pool(2);
        let first = p.acquire().expect("test: lease");
        p.report_outcome(&first, CredentialOutcome::Success);
        let other = p
            .acquire_excluding(&[1])
            .expect("test: index 0 still available");
        assert_eq!(other.index, 0);
        p.report_outcome(&other, CredentialOutcome::Success);
        let err = pool(1).acquire_excluding(&[0]).expect_err("test: only key excluded");
        assert!(matches!(err, OrchestratorError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_its_slot() {
        let p = pool(2);
        let abandoned = p.acquire().expect("test: lease");
        assert_eq!(abandoned.index, 0);
        drop(abandoned);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let lease = p.acquire().expect("test: lease");
            seen.push(lease.index);
            p.report_outcome(&lease, CredentialOutcome::Success);
        }
        assert_eq!(seen, vec![1, 0, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_report_for_a_lease_is_ignored() {
        let p = pool(1);
        let lease = p.acquire().expect("test: lease");
        p.report_outcome(&lease, CredentialOutcome::Success);
        p.report_outcome(&lease, CredentialOutcome::Failure);
        assert_eq!(p.status()[0].health, HealthState::Healthy);
        assert_eq!(p.status()[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_elapsed_cooldown_as_healthy() {
        let p = pool(1);
        fail(&p);
        assert!(matches!(p.status()[0].health, HealthState::CoolingDown { .. }));

        tokio::time::advance(Duration::from_secs(30)).await;
        let status = p.status();
        assert_eq!(status[0].health, HealthState::Healthy);
        assert_eq!(status[0].consecutive_failures, 1);
    }

    #[test]
    fn test_pools_missing_or_empty_provider_is_misconfiguration() {
        let pools = CredentialPools::new()
            .with_pool(pool(1))
            .with_pool(CredentialPool::new("groq", BackoffPolicy::default()));
        assert!(pools.get("openai").is_ok());
        for provider in ["groq", "mistral"] {
            let err = pools.get(provider).expect_err("test: not configured");
            assert!(matches!(err, OrchestratorError::NoCredentialAvailable { .. }));
        }
    }
}
