//! The `vq-daemon` binary: wires every crate in the workspace into one
//! long-running process per spec §6 — the Job Orchestrator's poll loop,
//! lease/inflight reclamation, the fixed-size analysis/QA worker pool, and
//! the configuration file watcher, coordinated by a single `ShutdownSignal`.

pub mod control_socket;
pub mod daemon;

pub use daemon::{Daemon, DaemonError, DaemonIntervals};
