//! Conversation threads and their status graph.
//!
//! ```text
//! INITIALIZING → RESPONDING → EVALUATING → {COMPLETED | ITERATING | STOPPED | FAILED}
//!                    ▲                          │
//!                    └──────── ITERATING ◄──────┘
//! ```
//!
//! Every status change goes through [`ConversationThread::transition`], which
//! rejects edges outside this graph, never leaves a terminal status, and keeps
//! `current_iteration <= max_iterations`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::cost::CostLedger;
use crate::gateway::GenerationAttempt;
use crate::OrchestratorError;

/// Lifecycle status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    /// Created, nothing dispatched yet.
    Initializing,
    /// Waiting on the primary model.
    Responding,
    /// Collecting critiques and scoring.
    Evaluating,
    /// About to request a refined answer.
    Iterating,
    /// Quality threshold met or iteration cap reached.
    Completed,
    /// Stopped by policy (cost) or by the caller.
    Stopped,
    /// Primary generation failed.
    Failed,
}

impl ThreadStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    /// Whether `self → next` is an edge of the status graph.
    pub fn can_transition_to(&self, next: ThreadStatus) -> bool {
        use ThreadStatus::*;
        matches!(
            (*self, next),
            (Initializing, Responding | Stopped | Failed)
                | (Responding, Evaluating | Stopped | Failed)
                | (Evaluating, Completed | Iterating | Stopped | Failed)
                | (Iterating, Responding | Stopped)
        )
    }

    /// Stable upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Responding => "RESPONDING",
            Self::Evaluating => "EVALUATING",
            Self::Iterating => "ITERATING",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-thread limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationPolicy {
    /// Maximum primary responses, at least 1.
    pub max_iterations: u32,
    /// Quality at which the thread completes, in `[0, 1]`.
    pub quality_threshold: f64,
    /// Budget in USD; reaching it stops the thread.
    pub cost_limit: Option<f64>,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            quality_threshold: 0.8,
            cost_limit: None,
        }
    }
}

impl OrchestrationPolicy {
    /// Check the documented bounds.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidPolicy`] naming the first violation.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_iterations < 1 {
            return Err(OrchestratorError::InvalidPolicy(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(OrchestratorError::InvalidPolicy(format!(
                "quality_threshold must be in [0, 1], got {}",
                self.quality_threshold
            )));
        }
        if let Some(limit) = self.cost_limit {
            if !limit.is_finite() || limit < 0.0 {
                return Err(OrchestratorError::InvalidPolicy(format!(
                    "cost_limit must be a non-negative amount, got {limit}"
                )));
            }
        }
        Ok(())
    }
}

/// One primary response and its evaluated quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// Iteration that produced the response (1-based).
    pub iteration: u32,
    /// Registry id of the primary model.
    pub model: String,
    /// Response text.
    pub text: String,
    /// Quality in `[0, 1]`, `None` until evaluated.
    pub quality: Option<f64>,
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Status before.
    pub from: ThreadStatus,
    /// Status after.
    pub to: ThreadStatus,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// The unit of iteration: one prompt driven to a terminal status.
///
/// Owned by the orchestrator while it runs; snapshots are handed to a
/// [`ThreadStore`](super::ThreadStore) after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    /// Thread identifier.
    pub id: Uuid,
    /// Prompt as submitted.
    pub prompt: String,
    /// Domain tag of the prompt.
    pub domain: String,
    /// Current status.
    pub status: ThreadStatus,
    /// Iteration in progress (0 before the first response).
    pub current_iteration: u32,
    /// Limits for this thread.
    pub policy: OrchestrationPolicy,
    /// Registry id of the primary model in use.
    pub primary_model: Option<String>,
    /// Highest-quality response seen so far.
    pub best_response: Option<ResponseRecord>,
    /// Most recent primary response.
    pub latest_response: Option<ResponseRecord>,
    /// Cost charges.
    pub cost: CostLedger,
    /// Every gateway attempt, primary and critique.
    pub attempts: Vec<GenerationAttempt>,
    /// Failure that moved the thread to `FAILED`.
    pub error: Option<String>,
    /// Status history.
    pub history: Vec<StatusChange>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ConversationThread {
    /// New thread in `INITIALIZING`.
    pub fn new(prompt: impl Into<String>, domain: impl Into<String>, policy: OrchestrationPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            domain: domain.into(),
            status: ThreadStatus::Initializing,
            current_iteration: 0,
            policy,
            primary_model: None,
            best_response: None,
            latest_response: None,
            cost: CostLedger::new(),
            attempts: Vec::new(),
            error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Accumulated cost in USD.
    pub fn total_cost(&self) -> f64 {
        self.cost.total_usd()
    }

    /// Whether the cost limit has been reached.
    pub fn cost_limit_reached(&self) -> bool {
        self.cost.limit_reached(self.policy.cost_limit)
    }

    /// Move to `to`. Entering `RESPONDING` starts the next iteration.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidTransition`] when the edge is not in
    /// the status graph, or when it would start an iteration past
    /// `max_iterations`. The thread is left unchanged.
    pub fn transition(&mut self, to: ThreadStatus) -> Result<(), OrchestratorError> {
        let from = self.status;
        let invalid = || OrchestratorError::InvalidTransition { from, to };
        if !from.can_transition_to(to) {
            return Err(invalid());
        }
        if to == ThreadStatus::Responding {
            if self.current_iteration >= self.policy.max_iterations {
                return Err(invalid());
            }
            self.current_iteration += 1;
        }
        self.status = to;
        self.updated_at = Utc::now();
        self.history.push(StatusChange {
            from,
            to,
            at: self.updated_at,
        });
        Ok(())
    }

    /// Record a fresh primary response for the current iteration.
    pub fn record_response(&mut self, model: impl Into<String>, text: impl Into<String>) {
        self.latest_response = Some(ResponseRecord {
            iteration: self.current_iteration,
            model: model.into(),
            text: text.into(),
            quality: None,
        });
        self.updated_at = Utc::now();
    }

    /// Attach a quality score to the latest response and promote it to best
    /// if it beats the previous best.
    pub fn score_latest(&mut self, quality: f64) {
        let Some(latest) = self.latest_response.as_mut() else {
            return;
        };
        latest.quality = Some(quality);
        let beats = match &self.best_response {
            Some(best) => quality > best.quality.unwrap_or(f64::MIN),
            None => true,
        };
        if beats {
            self.best_response = Some(latest.clone());
        }
        self.updated_at = Utc::now();
    }

    /// Best response if one was scored, else the latest unscored one.
    pub fn answer(&self) -> Option<&ResponseRecord> {
        self.best_response.as_ref().or(self.latest_response.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ThreadStatus::*;

    const ALL: [ThreadStatus; 7] = [
        Initializing,
        Responding,
        Evaluating,
        Iterating,
        Completed,
        Stopped,
        Failed,
    ];

    fn thread(max_iterations: u32) -> ConversationThread {
        ConversationThread::new(
            "prompt",
            "general",
            OrchestrationPolicy {
                max_iterations,
                ..OrchestrationPolicy::default()
            },
        )
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for from in [Completed, Stopped, Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_nothing_returns_to_initializing() {
        for from in ALL {
            assert!(!from.can_transition_to(Initializing));
        }
    }

    #[test]
    fn test_full_iteration_cycle() {
        let mut t = thread(2);
        for to in [Responding, Evaluating, Iterating, Responding, Evaluating, Completed] {
            t.transition(to).expect("test: valid edge");
        }
        assert_eq!(t.current_iteration, 2);
        assert_eq!(t.history.len(), 6);
    }

    #[test]
    fn test_iteration_cap_is_enforced_by_transition() {
        let mut t = thread(1);
        t.transition(Responding).expect("test: first");
        t.transition(Evaluating).expect("test: evaluate");
        t.transition(Iterating).expect("test: iterate");
        let err = t.transition(Responding).expect_err("test: cap");
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(t.current_iteration, 1);
        assert_eq!(t.status, Iterating);
    }

    #[test]
    fn test_invalid_edge_leaves_thread_unchanged() {
        let mut t = thread(3);
        let err = t.transition(Completed).expect_err("test: skip");
        assert_eq!(
            err,
            OrchestratorError::InvalidTransition {
                from: Initializing,
                to: Completed
            }
        );
        assert_eq!(t.status, Initializing);
        assert!(t.history.is_empty());
    }

    #[test]
    fn test_best_response_keeps_highest_quality() {
        let mut t = thread(3);
        t.transition(Responding).expect("test: edge");
        t.record_response("m", "first");
        t.score_latest(0.7);
        t.record_response("m", "second");
        t.score_latest(0.5);
        let best = t.best_response.as_ref().expect("test: best");
        assert_eq!(best.text, "first");
        assert_eq!(t.latest_response.as_ref().map(|r| r.text.as_str()), Some("second"));
    }

    #[test]
    fn test_policy_validation_bounds() {
        assert!(OrchestrationPolicy::default().validate().is_ok());
        let bad = [
            OrchestrationPolicy {
                max_iterations: 0,
                ..OrchestrationPolicy::default()
            },
            OrchestrationPolicy {
                quality_threshold: 1.5,
                ..OrchestrationPolicy::default()
            },
            OrchestrationPolicy {
                cost_limit: Some(-1.0),
                ..OrchestrationPolicy::default()
            },
        ];
        for p in bad {
            assert!(matches!(p.validate(), Err(OrchestratorError::InvalidPolicy(_))));
        }
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&Evaluating).expect("test: serialize");
        assert_eq!(json, "\"EVALUATING\"");
    }
}
