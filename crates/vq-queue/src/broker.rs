//! The task queue broker: per-analysis-type FIFO queues with priority
//! tiers, three corrective queues (one per QA tier), and three management
//! queues (`manual_review`, `priority`, `batch_completion`).
//!
//! Dequeue is peek-and-lease: an item is moved to an inflight slot and only
//! dropped from the broker on `ack`. `reclaim_inflight` requeues items whose
//! inflight deadline has passed at the head of their queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use vq_core::domain::{AnalysisType, Priority, QaTier};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' not found")]
    UnknownQueue(String),
    #[error("dequeue from '{0}' timed out")]
    Timeout(String),
    #[error("no inflight entry for task {0} in queue '{1}'")]
    NoInflightEntry(Uuid, String),
}

/// A reference to a task sitting in a queue: enough to re-fetch the full
/// `Task` row from the state store without the broker holding a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub task_id: Uuid,
    pub process_id: Uuid,
}

#[derive(Debug, Clone)]
struct Entry {
    task_ref: TaskRef,
    priority: Priority,
}

struct InflightEntry {
    entry: Entry,
    deadline: DateTime<Utc>,
}

struct Queue {
    high: VecDeque<Entry>,
    normal: VecDeque<Entry>,
    low: VecDeque<Entry>,
    inflight: std::collections::HashMap<Uuid, InflightEntry>,
    enqueued_keys: std::collections::HashSet<Uuid>,
    depth_limit: usize,
    admission: Arc<Semaphore>,
    notify: Arc<Notify>,
}

impl Queue {
    fn new(depth_limit: usize) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            inflight: std::collections::HashMap::new(),
            enqueued_keys: std::collections::HashSet::new(),
            depth_limit,
            admission: Arc::new(Semaphore::new(depth_limit)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn depth(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len() + self.inflight.len()
    }
}

/// Names the three management queues named outside the analysis-type and
/// QA-tier closed sets.
pub const MANAGEMENT_QUEUES: [&str; 3] = ["manual_review", "priority", "batch_completion"];

/// Returns the queue key for an analysis type's queue.
pub fn analysis_queue_key(t: AnalysisType) -> String {
    t.slug().to_string()
}

/// Returns the queue key for a QA tier's corrective-retry queue.
pub fn corrective_queue_key(tier: QaTier) -> String {
    format!("corrective_{}", tier.slug())
}

/// Fan-out task broker. Bounded FIFO queues per analysis type, per QA tier,
/// and the three management queues; priority-then-FIFO draining within a
/// queue; idempotent enqueue on `(task_id, queue_key)`.
pub struct TaskQueueBroker {
    queues: DashMap<String, Arc<tokio::sync::Mutex<Queue>>>,
    default_depth_limit: usize,
    inflight_ttl: Duration,
}

impl TaskQueueBroker {
    pub fn new(default_depth_limit: usize, inflight_ttl: Duration) -> Self {
        let queues = DashMap::new();
        for t in AnalysisType::ALL {
            queues.insert(
                analysis_queue_key(t),
                Arc::new(tokio::sync::Mutex::new(Queue::new(default_depth_limit))),
            );
        }
        for tier in QaTier::ORDER {
            queues.insert(
                corrective_queue_key(tier),
                Arc::new(tokio::sync::Mutex::new(Queue::new(default_depth_limit))),
            );
        }
        for name in MANAGEMENT_QUEUES {
            queues.insert(
                name.to_string(),
                Arc::new(tokio::sync::Mutex::new(Queue::new(default_depth_limit))),
            );
        }
        Self {
            queues,
            default_depth_limit,
            inflight_ttl,
        }
    }

    fn queue(&self, queue_key: &str) -> Result<Arc<tokio::sync::Mutex<Queue>>, QueueError> {
        self.queues
            .get(queue_key)
            .map(|q| q.clone())
            .ok_or_else(|| QueueError::UnknownQueue(queue_key.to_string()))
    }

    /// Enqueues `task_ref` into `queue_key` at `priority`. Idempotent on
    /// `(task_id, queue_key)` — a duplicate enqueue is a no-op. Blocks the
    /// caller while the queue is at its depth limit (backpressure with no
    /// drops).
    pub async fn enqueue(
        &self,
        queue_key: &str,
        task_ref: TaskRef,
        priority: Priority,
    ) -> Result<(), QueueError> {
        let queue_arc = self.queue(queue_key)?;
        let semaphore = {
            let guard = queue_arc.lock().await;
            guard.admission.clone()
        };

        {
            let guard = queue_arc.lock().await;
            if guard.enqueued_keys.contains(&task_ref.task_id) {
                return Ok(());
            }
        }

        let permit = semaphore
            .acquire_owned()
            .await
            .expect("queue semaphore never closed");

        let mut guard = queue_arc.lock().await;
        if guard.enqueued_keys.contains(&task_ref.task_id) {
            drop(permit);
            return Ok(());
        }
        guard.enqueued_keys.insert(task_ref.task_id);
        let entry = Entry { task_ref, priority };
        match priority {
            Priority::High => guard.high.push_back(entry),
            Priority::Normal => guard.normal.push_back(entry),
            Priority::Low => guard.low.push_back(entry),
        }
        std::mem::forget(permit);
        guard.notify.notify_one();
        Ok(())
    }

    /// Peeks the highest-priority, oldest-enqueued item and moves it to the
    /// inflight set with a lease deadline. Waits up to `wait_for` for an
    /// item to become available; returns `Timeout` if none does.
    pub async fn dequeue(&self, queue_key: &str, wait_for: Duration) -> Result<TaskRef, QueueError> {
        let queue_arc = self.queue(queue_key)?;
        let deadline = tokio::time::Instant::now() + wait_for;

        loop {
            let notify = {
                let mut guard = queue_arc.lock().await;
                if let Some(entry) = guard.high.pop_front().or_else(|| guard.normal.pop_front()).or_else(|| guard.low.pop_front()) {
                    let task_id = entry.task_ref.task_id;
                    guard.inflight.insert(
                        task_id,
                        InflightEntry {
                            entry,
                            deadline: Utc::now() + chrono::Duration::from_std(self.inflight_ttl).unwrap(),
                        },
                    );
                    return Ok(guard.inflight.get(&task_id).unwrap().entry.task_ref.clone());
                }
                guard.notify.clone()
            };

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(QueueError::Timeout(queue_key.to_string()));
            }
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    /// Acknowledges completion of `task_id` out of `queue_key`'s inflight
    /// set, releasing its admission slot.
    pub async fn ack(&self, queue_key: &str, task_id: Uuid) -> Result<(), QueueError> {
        let queue_arc = self.queue(queue_key)?;
        let mut guard = queue_arc.lock().await;
        guard
            .inflight
            .remove(&task_id)
            .ok_or_else(|| QueueError::NoInflightEntry(task_id, queue_key.to_string()))?;
        guard.enqueued_keys.remove(&task_id);
        guard.admission.add_permits(1);
        Ok(())
    }

    pub async fn depth(&self, queue_key: &str) -> Result<usize, QueueError> {
        let queue_arc = self.queue(queue_key)?;
        Ok(queue_arc.lock().await.depth())
    }

    /// Requeues inflight items past their deadline at the head of their
    /// priority band, so a crashed worker's item is retried before freshly
    /// enqueued work at the same priority. Returns the number requeued.
    pub async fn reclaim_inflight(&self) -> usize {
        let mut reclaimed = 0;
        for entry in self.queues.iter() {
            let mut guard = entry.value().lock().await;
            let now = Utc::now();
            let expired: Vec<Uuid> = guard
                .inflight
                .iter()
                .filter(|(_, v)| v.deadline < now)
                .map(|(k, _)| *k)
                .collect();
            for task_id in expired {
                if let Some(inflight) = guard.inflight.remove(&task_id) {
                    match inflight.entry.priority {
                        Priority::High => guard.high.push_front(inflight.entry),
                        Priority::Normal => guard.normal.push_front(inflight.entry),
                        Priority::Low => guard.low.push_front(inflight.entry),
                    }
                    guard.notify.notify_one();
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }

    pub fn default_depth_limit(&self) -> usize {
        self.default_depth_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_ref() -> TaskRef {
        TaskRef {
            task_id: Uuid::new_v4(),
            process_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_roundtrips() {
        let broker = TaskQueueBroker::new(10, Duration::from_secs(30));
        let key = analysis_queue_key(AnalysisType::ObjectDetection);
        let tr = task_ref();
        broker.enqueue(&key, tr.clone(), Priority::Normal).await.unwrap();
        assert_eq!(broker.depth(&key).await.unwrap(), 1);

        let leased = broker.dequeue(&key, Duration::from_millis(100)).await.unwrap();
        assert_eq!(leased.task_id, tr.task_id);
        assert_eq!(broker.depth(&key).await.unwrap(), 1);

        broker.ack(&key, tr.task_id).await.unwrap();
        assert_eq!(broker.depth(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn high_priority_drains_before_normal() {
        let broker = TaskQueueBroker::new(10, Duration::from_secs(30));
        let key = analysis_queue_key(AnalysisType::FaceDetection);
        let normal = task_ref();
        let high = task_ref();
        broker.enqueue(&key, normal.clone(), Priority::Normal).await.unwrap();
        broker.enqueue(&key, high.clone(), Priority::High).await.unwrap();

        let first = broker.dequeue(&key, Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.task_id, high.task_id);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_idempotent() {
        let broker = TaskQueueBroker::new(10, Duration::from_secs(30));
        let key = analysis_queue_key(AnalysisType::ColorPalette);
        let tr = task_ref();
        broker.enqueue(&key, tr.clone(), Priority::Normal).await.unwrap();
        broker.enqueue(&key, tr.clone(), Priority::High).await.unwrap();
        assert_eq!(broker.depth(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let broker = TaskQueueBroker::new(10, Duration::from_secs(30));
        let key = analysis_queue_key(AnalysisType::TextExtraction);
        let err = broker.dequeue(&key, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, QueueError::Timeout(_)));
    }

    #[tokio::test]
    async fn enqueue_blocks_at_depth_limit_until_ack() {
        let broker = Arc::new(TaskQueueBroker::new(1, Duration::from_secs(30)));
        let key = analysis_queue_key(AnalysisType::QualityAssessment);
        let first = task_ref();
        broker.enqueue(&key, first.clone(), Priority::Normal).await.unwrap();

        let broker2 = broker.clone();
        let key2 = key.clone();
        let second = task_ref();
        let second_id = second.task_id;
        let handle = tokio::spawn(async move {
            broker2.enqueue(&key2, second, Priority::Normal).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        let leased = broker.dequeue(&key, Duration::from_millis(50)).await.unwrap();
        broker.ack(&key, leased.task_id).await.unwrap();

        tokio::time::timeout(Duration::from_millis(200), handle).await.unwrap().unwrap();
        assert_eq!(broker.depth(&key).await.unwrap(), 1);
        let leased2 = broker.dequeue(&key, Duration::from_millis(50)).await.unwrap();
        assert_eq!(leased2.task_id, second_id);
    }

    #[tokio::test]
    async fn reclaim_inflight_requeues_expired_leases() {
        let broker = TaskQueueBroker::new(10, Duration::from_millis(10));
        let key = corrective_queue_key(QaTier::Structural);
        let tr = task_ref();
        broker.enqueue(&key, tr.clone(), Priority::Normal).await.unwrap();
        broker.dequeue(&key, Duration::from_millis(100)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = broker.reclaim_inflight().await;
        assert_eq!(reclaimed, 1);

        let leased = broker.dequeue(&key, Duration::from_millis(50)).await.unwrap();
        assert_eq!(leased.task_id, tr.task_id);
    }

    #[tokio::test]
    async fn management_queues_exist() {
        let broker = TaskQueueBroker::new(10, Duration::from_secs(30));
        for name in MANAGEMENT_QUEUES {
            assert_eq!(broker.depth(name).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn unknown_queue_key_errors() {
        let broker = TaskQueueBroker::new(10, Duration::from_secs(30));
        assert!(broker.depth("not_a_real_queue").await.is_err());
    }
}
