//! Per-process task failure-rate circuit breaker (spec §4.F): if a process's
//! aggregate task failure rate exceeds 30% over a sliding window, further
//! enqueues for that process are halted and a high-severity audit event is
//! recorded. Existing in-flight tasks are left to complete.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

struct Window {
    outcomes: VecDeque<Outcome>,
    tripped: bool,
}

impl Window {
    fn new() -> Self {
        Self { outcomes: VecDeque::new(), tripped: false }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|o| **o == Outcome::Failure).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// Tracks recent task outcomes per process and trips a one-way breaker once
/// the failure rate within the trailing window exceeds the configured
/// threshold. Once tripped, a process stays tripped — matching spec's "halts
/// further enqueues for that process" rather than a recovering breaker.
pub struct ProcessFailureTracker {
    windows: DashMap<Uuid, Arc<Mutex<Window>>>,
    window_size: usize,
    threshold: f64,
}

impl ProcessFailureTracker {
    pub fn new(window_size: usize, threshold: f64) -> Self {
        Self { windows: DashMap::new(), window_size, threshold }
    }

    fn window(&self, process_id: Uuid) -> Arc<Mutex<Window>> {
        self.windows.entry(process_id).or_insert_with(|| Arc::new(Mutex::new(Window::new()))).clone()
    }

    /// Records a task outcome and returns whether the breaker is tripped
    /// for this process *after* recording it.
    pub async fn record(&self, process_id: Uuid, succeeded: bool) -> bool {
        let window = self.window(process_id);
        let mut guard = window.lock().await;
        if guard.tripped {
            return true;
        }
        guard.outcomes.push_back(if succeeded { Outcome::Success } else { Outcome::Failure });
        while guard.outcomes.len() > self.window_size {
            guard.outcomes.pop_front();
        }
        if guard.failure_rate() > self.threshold {
            warn!(process = %process_id, rate = guard.failure_rate(), "process failure-rate breaker tripped");
            guard.tripped = true;
        }
        guard.tripped
    }

    pub async fn is_tripped(&self, process_id: Uuid) -> bool {
        self.window(process_id).lock().await.tripped
    }

    pub fn forget(&self, process_id: Uuid) {
        self.windows.remove(&process_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stays_closed_under_threshold() {
        let tracker = ProcessFailureTracker::new(10, 0.30);
        let pid = Uuid::new_v4();
        for _ in 0..7 {
            assert!(!tracker.record(pid, true).await);
        }
        for _ in 0..2 {
            assert!(!tracker.record(pid, false).await);
        }
        assert!(!tracker.is_tripped(pid).await);
    }

    #[tokio::test]
    async fn trips_once_failure_rate_exceeds_threshold() {
        let tracker = ProcessFailureTracker::new(10, 0.30);
        let pid = Uuid::new_v4();
        for _ in 0..6 {
            tracker.record(pid, true).await;
        }
        for _ in 0..4 {
            tracker.record(pid, false).await;
        }
        assert!(tracker.is_tripped(pid).await);
    }

    #[tokio::test]
    async fn stays_tripped_even_if_later_outcomes_all_succeed() {
        let tracker = ProcessFailureTracker::new(5, 0.30);
        let pid = Uuid::new_v4();
        for _ in 0..3 {
            tracker.record(pid, false).await;
        }
        assert!(tracker.is_tripped(pid).await);
        for _ in 0..10 {
            assert!(tracker.record(pid, true).await);
        }
    }

    #[tokio::test]
    async fn window_evicts_oldest_outcomes() {
        let tracker = ProcessFailureTracker::new(4, 0.30);
        let pid = Uuid::new_v4();
        tracker.record(pid, false).await;
        tracker.record(pid, false).await;
        for _ in 0..20 {
            tracker.record(pid, true).await;
        }
        assert!(!tracker.is_tripped(pid).await);
    }

    #[tokio::test]
    async fn separate_processes_track_independently() {
        let tracker = ProcessFailureTracker::new(10, 0.30);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for _ in 0..5 {
            tracker.record(a, false).await;
        }
        assert!(tracker.is_tripped(a).await);
        assert!(!tracker.is_tripped(b).await);
    }
}
