//! # Stage: Orchestration Engine
//!
//! ## Responsibility
//! Drive one [`ConversationThread`] per prompt through the status graph:
//! select, respond, critique, evaluate, then complete, iterate, stop or fail.
//! Persist a snapshot after every transition.
//!
//! ## Guarantees
//! - Bounded: `current_iteration <= max_iterations`, enforced on every
//!   transition; status only moves along the documented graph.
//! - Monotone: cost only grows; the best response is the highest-quality
//!   one seen, not necessarily the latest.
//! - Explicit: the caller always gets a response or a terminal status.
//!   Only a primary-generation failure can end a thread in `FAILED`.
//! - Non-blocking on storage: a failed snapshot save is logged, not fatal.
//! - Cooperative cancellation: honoured between transitions only.
//!
//! ## NOT Responsible For
//! - Key rotation and retries (that belongs to `credentials` and `gateway`)
//! - Concurrency across threads (callers spawn as many as they like)

pub mod cost;
pub mod orchestrator;
pub mod quality;
pub mod store;
pub mod thread;

// Re-exports for convenience
pub use cost::{CostEntry, CostLedger};
pub use orchestrator::{
    refinement_prompt, CancelHandle, EngineConfig, ModelRetention, OrchestrationResult,
    Orchestrator,
};
pub use quality::{QualityEstimate, ScoreSource};
pub use store::{InMemoryThreadStore, JsonFileThreadStore, StoreError, ThreadStore};
pub use thread::{ConversationThread, OrchestrationPolicy, ResponseRecord, StatusChange, ThreadStatus};
