//! The task pipeline: the Analysis Worker and QA Pipeline that together
//! carry a task from `pending` through to `completed` or `manual_review`.

pub mod qa;
pub mod worker;

pub use qa::{QaError, QaPipeline, TierResult};
pub use worker::{AnalysisWorker, WorkerError};
