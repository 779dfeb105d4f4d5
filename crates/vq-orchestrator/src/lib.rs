//! The Job Orchestrator: acquires jobs from the external job registry,
//! expands them into per-media, per-analysis tasks, and reports task and
//! process outcomes back, per spec §4.F. Also owns the per-process failure
//! circuit breaker that trips a process into `manual_review` triage when its
//! task failure rate crosses a threshold.

pub mod failure_tracker;
pub mod orchestrator;

pub use failure_tracker::ProcessFailureTracker;
pub use orchestrator::{JobOrchestrator, OrchestratorError};
