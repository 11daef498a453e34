//! Prometheus metrics for the orchestration engine.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_thread`, `record_provider_request`, …) are no-ops if `init_metrics`
//! was never called, so the engine is always safe to run and observability
//! simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `orchestrator_threads_total` | Counter | `status` |
//! | `orchestrator_provider_requests_total` | Counter | `provider`, `outcome` |
//! | `orchestrator_provider_latency_seconds` | Histogram | `provider` |
//! | `orchestrator_critiques_total` | Counter | `outcome` |
//! | `orchestrator_credential_cooldowns_total` | Counter | `provider` |

use crate::OrchestratorError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the engine, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Threads that reached a terminal status.
    pub threads_total: CounterVec,
    /// Provider calls by provider and outcome.
    pub provider_requests: CounterVec,
    /// Provider call latency.
    pub provider_latency: HistogramVec,
    /// Critique outcomes (`collected`, `failed`, `timed_out`).
    pub critiques_total: CounterVec,
    /// Credentials placed into cooldown.
    pub credential_cooldowns: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_error(e: prometheus::Error) -> OrchestratorError {
    OrchestratorError::Other(format!("metrics init failed: {e}"))
}

fn register(registry: &Registry, c: Box<dyn Collector>) -> Result<(), OrchestratorError> {
    registry
        .register(c)
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))
}

fn build_metrics(prefix: &str) -> Result<Metrics, OrchestratorError> {
    let registry = Registry::new();

    let threads_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_threads_total"),
            "Threads finished by terminal status",
        ),
        &["status"],
    )
    .map_err(build_error)?;
    register(&registry, Box::new(threads_total.clone()))?;

    let provider_requests = CounterVec::new(
        Opts::new(
            format!("{prefix}_provider_requests_total"),
            "Provider calls by provider and outcome",
        ),
        &["provider", "outcome"],
    )
    .map_err(build_error)?;
    register(&registry, Box::new(provider_requests.clone()))?;

    let provider_latency = HistogramVec::new(
        HistogramOpts::new(
            format!("{prefix}_provider_latency_seconds"),
            "Provider call latency",
        ),
        &["provider"],
    )
    .map_err(build_error)?;
    register(&registry, Box::new(provider_latency.clone()))?;

    let critiques_total = CounterVec::new(
        Opts::new(format!("{prefix}_critiques_total"), "Critique outcomes"),
        &["outcome"],
    )
    .map_err(build_error)?;
    register(&registry, Box::new(critiques_total.clone()))?;

    let credential_cooldowns = CounterVec::new(
        Opts::new(
            format!("{prefix}_credential_cooldowns_total"),
            "Credentials placed into cooldown",
        ),
        &["provider"],
    )
    .map_err(build_error)?;
    register(&registry, Box::new(credential_cooldowns.clone()))?;

    Ok(Metrics {
        registry,
        threads_total,
        provider_requests,
        provider_latency,
        critiques_total,
        credential_cooldowns,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build_metrics("orchestrator")?;
    // A racing initialiser produces identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a thread reaching a terminal status.
///
/// No-op if metrics have not been initialised.
pub fn inc_thread(status: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.threads_total.get_metric_with_label_values(&[status]) {
            c.inc();
        }
    }
}

/// Count one provider call and observe its latency.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_provider_request(provider: &str, outcome: &str, latency: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .provider_requests
            .get_metric_with_label_values(&[provider, outcome])
        {
            c.inc();
        }
        if let Ok(h) = m.provider_latency.get_metric_with_label_values(&[provider]) {
            h.observe(latency.as_secs_f64());
        }
    }
}

/// Count a critique outcome.
///
/// No-op if metrics have not been initialised.
pub fn inc_critique(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.critiques_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count a credential entering cooldown.
///
/// No-op if metrics have not been initialised.
pub fn inc_cooldown(provider: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .credential_cooldowns
            .get_metric_with_label_values(&[provider])
        {
            c.inc();
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Structured snapshot of the counters, for logs and the demo binary.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Terminal thread counts keyed by status.
    pub threads_total: HashMap<String, u64>,
    /// Provider call counts keyed by `"provider:outcome"`.
    pub provider_requests: HashMap<String, u64>,
    /// Critique counts keyed by outcome.
    pub critiques_total: HashMap<String, u64>,
}

fn label<'a>(metric: &'a prometheus::proto::Metric, name: &str) -> &'a str {
    metric
        .get_label()
        .iter()
        .find(|l| l.get_name() == name)
        .map_or("unknown", |l| l.get_value())
}

/// Return a structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    summarize(m)
}

fn summarize(m: &Metrics) -> MetricsSummary {
    let mut summary = MetricsSummary::default();

    for family in m.threads_total.collect() {
        for metric in family.get_metric() {
            let value = metric.get_counter().get_value() as u64;
            summary
                .threads_total
                .insert(label(metric, "status").to_string(), value);
        }
    }

    for family in m.provider_requests.collect() {
        for metric in family.get_metric() {
            let key = format!(
                "{}:{}",
                label(metric, "provider"),
                label(metric, "outcome")
            );
            let value = metric.get_counter().get_value() as u64;
            summary.provider_requests.insert(key, value);
        }
    }

    for family in m.critiques_total.collect() {
        for metric in family.get_metric() {
            let value = metric.get_counter().get_value() as u64;
            summary
                .critiques_total
                .insert(label(metric, "outcome").to_string(), value);
        }
    }

    summary
}
