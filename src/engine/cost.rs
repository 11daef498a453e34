//! Per-thread cost accounting.
//!
//! Costs are stored as micro-dollars (1 USD = 1 000 000 micro-dollars) to
//! avoid floating-point drift while a thread accumulates many small charges.
//! The ledger only ever grows.

use serde::{Deserialize, Serialize};

/// Convert USD to micro-dollars. Negative and non-finite inputs map to 0.
pub fn usd_to_micro(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 1_000_000.0).round() as u64
    } else {
        0
    }
}

/// Convert micro-dollars to USD.
pub fn micro_to_usd(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

/// Cost of `tokens` at `usd_per_1k`, in micro-dollars.
///
/// # Panics
///
/// This function never panics.
pub fn call_cost_micro(tokens: u64, usd_per_1k: f64) -> u64 {
    let rate = usd_to_micro(usd_per_1k) as u128;
    let micro = (tokens as u128 * rate) / 1000;
    u64::try_from(micro).unwrap_or(u64::MAX)
}

/// One charge on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEntry {
    /// Registry id of the model that was paid.
    pub model: String,
    /// Iteration the charge belongs to.
    pub iteration: u32,
    /// Tokens billed.
    pub tokens: u64,
    /// Charge in micro-dollars.
    pub micro: u64,
}

/// Append-only cost ledger for one thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostLedger {
    total_micro: u64,
    entries: Vec<CostEntry>,
}

impl CostLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `tokens` of `model` at `usd_per_1k`. Returns the charge.
    pub fn charge(&mut self, model: &str, iteration: u32, tokens: u64, usd_per_1k: f64) -> u64 {
        let micro = call_cost_micro(tokens, usd_per_1k);
        self.total_micro = self.total_micro.saturating_add(micro);
        self.entries.push(CostEntry {
            model: model.to_string(),
            iteration,
            tokens,
            micro,
        });
        micro
    }

    /// Accumulated cost in USD.
    pub fn total_usd(&self) -> f64 {
        micro_to_usd(self.total_micro)
    }

    /// Accumulated cost in micro-dollars.
    pub fn total_micro(&self) -> u64 {
        self.total_micro
    }

    /// Charges in the order they were made.
    pub fn entries(&self) -> &[CostEntry] {
        &self.entries
    }

    /// Whether the budget is used up: `total >= limit`. `None` never is.
    pub fn limit_reached(&self, limit: Option<f64>) -> bool {
        limit.map_or(false, |l| self.total_micro >= usd_to_micro(l))
    }
}
