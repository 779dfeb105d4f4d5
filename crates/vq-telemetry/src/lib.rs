//! Structured logging bootstrap for the engine's binaries.
//!
//! Metrics and health-check HTTP endpoints are out of scope for this
//! crate — the orchestrator exposes those as an external collaborator
//! behind its own trait boundary, not through telemetry.

pub mod logging;

pub use logging::{init_logging, init_logging_json};
