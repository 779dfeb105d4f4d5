//! The state store: durable system of record for processes, tasks, QA
//! attempts, and the per-process audit log, backed by SQLite.

pub mod store;

pub use store::{ProcessTaskSummary, StateStore, StoreError};
