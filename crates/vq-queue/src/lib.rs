//! The task queue broker: bounded per-analysis-type and per-QA-tier FIFO
//! queues with priority tiers, plus the three management queues.

pub mod broker;

pub use broker::{
    analysis_queue_key, corrective_queue_key, QueueError, TaskQueueBroker, TaskRef,
    MANAGEMENT_QUEUES,
};
