//! Reliability and lifecycle infrastructure shared by the orchestrator and
//! workers: a generic circuit breaker for wrapping external calls (vision
//! model, registry), and graceful-shutdown coordination for the daemon.

pub mod circuit_breaker;
pub mod shutdown;
