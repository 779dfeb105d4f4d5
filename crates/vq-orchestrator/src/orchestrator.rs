//! The Job Orchestrator: acquires jobs from the external registry, expands
//! them into per-media, per-analysis tasks, and reports task/process
//! outcomes back, per spec §4.F.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use vq_clients::job_registry::{
    AnalysisSubmission, JobRegistryClient, JobRegistryError, NextJob, ProjectStatus, QualityReport,
    ReportDetails,
};
use vq_clients::notification_sink::{notify_best_effort, NotificationChannel, NotificationSink};
use vq_core::domain::{AnalysisType, AuditSeverity, Priority, Process, ProcessStatus, Task, TaskStatus};
use vq_queue::broker::{analysis_queue_key, TaskQueueBroker, TaskRef};
use vq_registry::registry::ConfigRegistry;
use vq_store::StateStore;

use crate::failure_tracker::ProcessFailureTracker;

const SUBMISSION_BASE_BACKOFF: Duration = Duration::from_secs(1);
const SUBMISSION_BACKOFF_FACTOR: u32 = 2;
const SUBMISSION_JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] vq_store::StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] vq_queue::broker::QueueError),
    #[error("job registry error: {0}")]
    JobRegistry(#[from] JobRegistryError),
    #[error("job has an invalid shape: {0}")]
    InvalidJobShape(String),
    #[error("process {0} not found")]
    ProcessNotFound(Uuid),
    #[error("task {0} is not in a terminal state ({1:?})")]
    TaskNotTerminal(Uuid, TaskStatus),
}

fn submission_backoff(attempt: u32) -> Duration {
    let base_secs = SUBMISSION_BASE_BACKOFF.as_secs_f64() * (SUBMISSION_BACKOFF_FACTOR as f64).powi(attempt as i32 - 1);
    let jitter = base_secs * SUBMISSION_JITTER_FRACTION;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}

/// Validates that every id the registry sent back is a well-formed UUID,
/// per spec §4.F ("validates job shape ... all UUIDs").
fn validate_job_shape(job: &NextJob) -> Result<(), OrchestratorError> {
    Uuid::parse_str(&job.client.id).map_err(|_| OrchestratorError::InvalidJobShape(format!("client.id '{}'", job.client.id)))?;
    Uuid::parse_str(&job.project.id).map_err(|_| OrchestratorError::InvalidJobShape(format!("project.id '{}'", job.project.id)))?;
    if job.media.is_empty() {
        return Err(OrchestratorError::InvalidJobShape("media array is empty".into()));
    }
    if job.analyses.is_empty() {
        return Err(OrchestratorError::InvalidJobShape("analyses array is empty".into()));
    }
    for media in &job.media {
        Uuid::parse_str(&media.id).map_err(|_| OrchestratorError::InvalidJobShape(format!("media.id '{}'", media.id)))?;
    }
    for analysis in &job.analyses {
        Uuid::parse_str(&analysis.id).map_err(|_| OrchestratorError::InvalidJobShape(format!("analysis.id '{}'", analysis.id)))?;
    }
    Ok(())
}

/// Builds the frozen profile snapshot a process pins at acquisition time.
/// `ProfileSet` keys its corrective map by a `(AnalysisType, QaTier)` tuple,
/// which `serde_json` cannot use as an object key directly, so the snapshot
/// is assembled by hand from the individually-`Serialize`-able profiles
/// instead of serializing `ProfileSet` itself.
fn build_config_snapshot(registry: &ConfigRegistry, analysis_types: &[AnalysisType]) -> String {
    let snapshot = registry.current();
    let analysis: Vec<_> = analysis_types.iter().filter_map(|t| snapshot.get_analysis(*t)).collect();
    let corrective: Vec<_> = analysis_types
        .iter()
        .flat_map(|t| vq_core::domain::QaTier::ORDER.iter().map(move |tier| (*t, *tier)))
        .filter_map(|(t, tier)| snapshot.get_corrective(t, tier))
        .collect();
    serde_json::json!({
        "generation": registry.generation(),
        "analysis": analysis,
        "corrective": corrective,
    })
    .to_string()
}

fn build_quality_report(process: &Process, summary: &vq_store::ProcessTaskSummary) -> QualityReport {
    let total = process.totals.total.max(1);
    let success_rate = process.totals.completed as f64 / total as f64;
    let minutes = process
        .completed_at
        .unwrap_or_else(chrono::Utc::now)
        .signed_duration_since(process.created_at)
        .num_seconds() as f64
        / 60.0;

    QualityReport {
        summary: format!(
            "{} of {} analyses completed ({} manual review, {} failed)",
            process.totals.completed, process.totals.total, process.totals.manual_review, process.totals.failed
        ),
        details: ReportDetails {
            total_media_processed: summary.distinct_media,
            total_analyses_completed: process.totals.completed,
            processing_time_minutes: minutes.max(0.0),
            success_rate,
            analysis_types_completed: summary.completed_analysis_types.clone(),
            key_findings: Vec::new(),
        },
    }
}

/// Coordinates the full process lifecycle against the external job
/// registry: acquisition, task expansion, per-task result reporting, and
/// the final quality report.
pub struct JobOrchestrator {
    store: Arc<StateStore>,
    registry: Arc<ConfigRegistry>,
    broker: Arc<TaskQueueBroker>,
    job_registry: Arc<dyn JobRegistryClient>,
    notifications: Arc<dyn NotificationSink>,
    failure_tracker: Arc<ProcessFailureTracker>,
    submission_retry_budget: u32,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<ConfigRegistry>,
        broker: Arc<TaskQueueBroker>,
        job_registry: Arc<dyn JobRegistryClient>,
        notifications: Arc<dyn NotificationSink>,
        failure_tracker: Arc<ProcessFailureTracker>,
        submission_retry_budget: u32,
    ) -> Self {
        Self {
            store,
            registry,
            broker,
            job_registry,
            notifications,
            failure_tracker,
            submission_retry_budget,
        }
    }

    /// Polls the registry for the next job; on a 404 ("no job available")
    /// returns `Ok(None)` so the caller can back off and poll again.
    pub async fn acquire_next_job(&self) -> Result<Option<Process>, OrchestratorError> {
        let Some(job) = self.job_registry.next_job().await? else {
            return Ok(None);
        };

        if let Err(e) = validate_job_shape(&job) {
            warn!(error = %e, "rejected job with invalid shape");
            return Err(e);
        }

        let recognized: Vec<AnalysisType> = job
            .analyses
            .iter()
            .filter_map(|a| {
                let t = AnalysisType::from_slug(&a.slug);
                if t.is_none() {
                    warn!(slug = %a.slug, "job references an unrecognized analysis type, skipping it");
                }
                t
            })
            .collect();

        let total_tasks = (job.media.len() * recognized.len()) as u32;
        let config_snapshot = build_config_snapshot(&self.registry, &recognized);
        let media_refs = serde_json::to_string(&job.media).unwrap_or_else(|_| "[]".to_string());
        let process = Process::new(
            job.client.id.clone(),
            job.project.id.clone(),
            total_tasks,
            config_snapshot,
            media_refs,
        );

        self.store.create_process(&process).await?;
        self.expand_and_enqueue(&process, &job, &recognized).await?;
        self.ensure_processing_status_sent(&process).await?;

        info!(process = %process.id, tasks = total_tasks, "acquired job and enqueued tasks");
        Ok(Some(process))
    }

    async fn expand_and_enqueue(
        &self,
        process: &Process,
        job: &NextJob,
        analysis_types: &[AnalysisType],
    ) -> Result<(), OrchestratorError> {
        let mut tasks = Vec::with_capacity(job.media.len() * analysis_types.len());
        for media in &job.media {
            for analysis_type in analysis_types {
                tasks.push(Task::new(process.id, media.id.clone(), *analysis_type));
            }
        }

        self.store.create_tasks(&tasks).await?;

        let mut enqueued = 0usize;
        for task in &tasks {
            if self.failure_tracker.is_tripped(process.id).await {
                warn!(
                    process = %process.id,
                    remaining = tasks.len() - enqueued,
                    "breaker tripped mid-expansion, halting further enqueues for this process"
                );
                break;
            }
            let queue_key = analysis_queue_key(task.analysis_type);
            let task_ref = TaskRef { task_id: task.id, process_id: process.id };
            self.broker.enqueue(&queue_key, task_ref, Priority::Normal).await?;
            enqueued += 1;
        }

        notify_best_effort(
            &*self.notifications,
            NotificationChannel::BatchManifest,
            serde_json::json!({
                "process_id": process.id,
                "external_project_id": process.external_project_id,
                "media_count": job.media.len(),
                "analysis_count": analysis_types.len(),
                "total_tasks": tasks.len(),
                "enqueued_tasks": enqueued,
            }),
        )
        .await;

        Ok(())
    }

    /// Sends the registry's single "processing" status update exactly once
    /// per process (spec's "exactly one processing status update" ordering
    /// guarantee). Sent immediately after task expansion rather than on the
    /// first task's lease, which is equivalent in practice since no task can
    /// start before expansion completes.
    async fn ensure_processing_status_sent(&self, process: &Process) -> Result<(), OrchestratorError> {
        if process.processing_status_sent {
            return Ok(());
        }
        self.job_registry.set_project_status(&process.external_project_id, ProjectStatus::Processing).await?;
        self.store.mark_process_status(process.id, ProcessStatus::Processing, true, false).await?;
        Ok(())
    }

    /// Reports a single terminal task's outcome to the job registry and
    /// rolls it into the owning process's counters, completing the process
    /// once every task has reached a terminal state.
    pub async fn on_task_completed(&self, task: &Task) -> Result<(), OrchestratorError> {
        if !task.status.is_terminal() {
            return Err(OrchestratorError::TaskNotTerminal(task.id, task.status));
        }
        if task.submission_sent {
            return Ok(());
        }

        let tripped = self.failure_tracker.record(task.process_id, task.status == TaskStatus::Completed).await;
        if tripped {
            self.store
                .emit_audit(
                    task.process_id,
                    None,
                    "process_failure_breaker_tripped",
                    AuditSeverity::High,
                    serde_json::json!({ "trigger_task": task.id }),
                    Uuid::new_v4(),
                )
                .await?;
        }

        // Only `Completed` tasks carry an analysis result worth reporting to
        // the external registry; `Failed`/`ManualReview` outcomes are rolled
        // into the process's counters and the final quality report instead
        // of being sent as a fabricated per-task status.
        if task.status == TaskStatus::Completed {
            self.submit_task_result(task).await?;
        }
        self.store.mark_task_submission_sent(task.id).await?;

        let (completed_delta, failed_delta, manual_review_delta) = match task.status {
            TaskStatus::Completed => (1, 0, 0),
            TaskStatus::ManualReview => (0, 0, 1),
            _ => (0, 1, 0),
        };
        let process = self
            .store
            .update_process_counters(task.process_id, completed_delta, failed_delta, manual_review_delta)
            .await?;

        if process.totals.is_exhausted() {
            self.on_process_complete(process.id).await?;
        }

        Ok(())
    }

    /// Sends a completed task's analysis result to the job registry. Only
    /// called for `TaskStatus::Completed` tasks — `status` here always
    /// matches the external API's one documented terminal value.
    async fn submit_task_result(&self, task: &Task) -> Result<(), OrchestratorError> {
        let profile = self.registry.get_analysis_profile(task.analysis_type);
        let submission = AnalysisSubmission {
            model_used: profile.as_ref().map(|p| p.model.clone()).unwrap_or_default(),
            user_prompt_used: profile.as_ref().map(|p| p.user_prompt_template.clone()).unwrap_or_default(),
            system_prompt_used: profile.map(|p| p.system_prompt_template.clone()).unwrap_or_default(),
            status: "completed",
            analysis_result: task.result.clone().unwrap_or(serde_json::Value::Null),
        };

        let process = self.store.get_process(task.process_id).await?.ok_or(OrchestratorError::ProcessNotFound(task.process_id))?;

        let mut attempt = 1;
        loop {
            match self
                .job_registry
                .submit_analysis(&process.external_project_id, &task.media_id, &task.id.to_string(), &submission)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    warn!(task = %task.id, error = %e, "analysis submission rejected as non-retryable, abandoning");
                    self.store
                        .emit_audit(
                            task.process_id,
                            Some(task.id),
                            "task_submission_abandoned",
                            AuditSeverity::Warning,
                            serde_json::json!({ "reason": e.to_string() }),
                            Uuid::new_v4(),
                        )
                        .await?;
                    return Ok(());
                }
                Err(e) if attempt >= self.submission_retry_budget => {
                    warn!(task = %task.id, error = %e, attempt, "analysis submission retries exhausted");
                    return Err(OrchestratorError::JobRegistry(e));
                }
                Err(e) => {
                    warn!(task = %task.id, error = %e, attempt, "analysis submission failed, retrying");
                    tokio::time::sleep(submission_backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Submits the final quality report and marks the process completed,
    /// exactly once (spec's "exactly one completed status update").
    pub async fn on_process_complete(&self, process_id: Uuid) -> Result<(), OrchestratorError> {
        let process = self.store.get_process(process_id).await?.ok_or(OrchestratorError::ProcessNotFound(process_id))?;
        if process.completed_status_sent {
            return Ok(());
        }

        let summary = self.store.summarize_process_tasks(process_id).await?;
        let report = build_quality_report(&process, &summary);

        let mut attempt = 1;
        loop {
            match self.job_registry.submit_report(&process.external_project_id, &report).await {
                Ok(()) => break,
                Err(e) if !e.is_retryable() || attempt >= self.submission_retry_budget => {
                    warn!(process = %process_id, error = %e, "report submission failed, recording and continuing");
                    self.store
                        .emit_audit(
                            process_id,
                            None,
                            "report_submission_failed",
                            AuditSeverity::Warning,
                            serde_json::json!({ "reason": e.to_string() }),
                            Uuid::new_v4(),
                        )
                        .await?;
                    break;
                }
                Err(e) => {
                    warn!(process = %process_id, error = %e, attempt, "report submission failed, retrying");
                    tokio::time::sleep(submission_backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }

        let _ = self.job_registry.set_project_status(&process.external_project_id, ProjectStatus::Completed).await;
        self.store.mark_process_status(process_id, ProcessStatus::Completed, false, true).await?;
        notify_best_effort(&*self.notifications, NotificationChannel::BatchReport, report).await;
        self.failure_tracker.forget(process_id);

        info!(process = %process_id, "process completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vq_clients::job_registry::{AnalysisRef, ClientRef, MediaRef, ProjectRef};
    use vq_clients::{MockJobRegistryClient, MockNotificationSink};

    fn sample_job() -> NextJob {
        NextJob {
            client: ClientRef { id: Uuid::new_v4().to_string(), slug: "acme".into(), name: "Acme".into() },
            project: ProjectRef { id: Uuid::new_v4().to_string(), slug: "launch".into(), name: "Launch".into() },
            media: vec![MediaRef {
                id: Uuid::new_v4().to_string(),
                filename: "photo.jpg".into(),
                optimised_path: "https://cdn/photo-opt.jpg".into(),
                greyscale_path: "https://cdn/photo-gray.jpg".into(),
            }],
            analyses: vec![AnalysisRef {
                id: Uuid::new_v4().to_string(),
                name: "Object Detection".into(),
                slug: "object_detection".into(),
            }],
        }
    }

    fn write_minimal_tree(root: &std::path::Path) {
        let analysis_dir = root.join("analysis");
        let corrective_dir = root.join("corrective");
        std::fs::create_dir_all(&analysis_dir).unwrap();
        for t in AnalysisType::ALL {
            let yaml = format!(
                "analysis_type: {}\nmodel: vision-analysis\nsystem_prompt_template: \"go\"\nuser_prompt_template: \"{{{{IMAGE}}}}\"\noutput_schema: {{}}\nprohibited_phrases: [\"x\"]\n",
                t.slug()
            );
            std::fs::write(analysis_dir.join(format!("{}.yaml", t.slug())), yaml).unwrap();
            let tier_dir = corrective_dir.join(t.slug());
            std::fs::create_dir_all(&tier_dir).unwrap();
            for tier in vq_core::domain::QaTier::ORDER {
                let yaml = format!(
                    "analysis_type: {}\ntier: {}\nmodel: vision-qa\nmax_attempts: 3\nsystem_prompt_template: \"go\"\nuser_prompt_template: \"{{{{PRIOR_OUTPUT}}}} {{{{IMAGE}}}}\"\noutput_schema: {{}}\nprohibited_phrases: [\"x\"]\n",
                    t.slug(),
                    tier.slug()
                );
                std::fs::write(tier_dir.join(format!("{}.yaml", tier.slug())), yaml).unwrap();
            }
        }
    }

    async fn build_orchestrator(dir: &std::path::Path) -> (JobOrchestrator, Arc<MockJobRegistryClient>) {
        write_minimal_tree(dir);
        let store = Arc::new(StateStore::new_in_memory().await.unwrap());
        let registry = Arc::new(ConfigRegistry::load(dir).unwrap());
        let broker = Arc::new(TaskQueueBroker::new(1000, Duration::from_secs(300)));
        let job_registry = Arc::new(MockJobRegistryClient::new().with_job(sample_job()));
        let notifications = Arc::new(MockNotificationSink::new());
        let failure_tracker = Arc::new(ProcessFailureTracker::new(20, 0.30));
        let orchestrator = JobOrchestrator::new(store, registry, broker, job_registry.clone(), notifications, failure_tracker, 3);
        (orchestrator, job_registry)
    }

    #[tokio::test]
    async fn acquire_next_job_expands_one_task_per_media_analysis_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, job_registry) = build_orchestrator(dir.path()).await;

        let process = orchestrator.acquire_next_job().await.unwrap().unwrap();
        assert_eq!(process.totals.total, 1);
        assert_eq!(job_registry.status_calls(), vec![(process.external_project_id.clone(), ProjectStatus::Processing)]);

        let depth = orchestrator.broker.depth(&analysis_queue_key(AnalysisType::ObjectDetection)).await.unwrap();
        assert_eq!(depth, 1);
    }

    #[tokio::test]
    async fn acquire_next_job_returns_none_when_registry_has_no_job() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_tree(dir.path());
        let store = Arc::new(StateStore::new_in_memory().await.unwrap());
        let registry = Arc::new(ConfigRegistry::load(dir.path()).unwrap());
        let broker = Arc::new(TaskQueueBroker::new(1000, Duration::from_secs(300)));
        let job_registry = Arc::new(MockJobRegistryClient::new());
        let notifications = Arc::new(MockNotificationSink::new());
        let failure_tracker = Arc::new(ProcessFailureTracker::new(20, 0.30));
        let orchestrator = JobOrchestrator::new(store, registry, broker, job_registry, notifications, failure_tracker, 3);

        assert!(orchestrator.acquire_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn on_task_completed_is_idempotent_on_already_sent_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, job_registry) = build_orchestrator(dir.path()).await;
        let process = orchestrator.acquire_next_job().await.unwrap().unwrap();

        let queue_key = analysis_queue_key(AnalysisType::ObjectDetection);
        let task_ref = orchestrator.broker.dequeue(&queue_key, Duration::from_millis(100)).await.unwrap();

        // Drive the task to Completed through the legal transition chain.
        let leased = orchestrator.store.lease_task(task_ref.task_id, "w1", chrono::Duration::seconds(60)).await.unwrap();
        let awaiting = orchestrator.store.transition_task(leased.id, TaskStatus::Running, TaskStatus::AwaitingQa).await.unwrap();
        orchestrator.store.set_task_result(awaiting.id, serde_json::json!({"label": "cat"})).await.unwrap();
        let completed = orchestrator.store.transition_task(awaiting.id, TaskStatus::AwaitingQa, TaskStatus::Completed).await.unwrap();

        orchestrator.on_task_completed(&completed).await.unwrap();
        assert_eq!(job_registry.submission_count(), 1);

        // Re-running on the same (now submission_sent) task is a no-op.
        let refetched = orchestrator.store.get_task(completed.id).await.unwrap().unwrap();
        orchestrator.on_task_completed(&refetched).await.unwrap();
        assert_eq!(job_registry.submission_count(), 1);

        // With only one task in the process, it also auto-completes.
        assert_eq!(job_registry.report_count(), 1);
        let final_process = orchestrator.store.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(final_process.status, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn on_task_completed_rejects_non_terminal_task() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _job_registry) = build_orchestrator(dir.path()).await;
        let task = Task::new(Uuid::new_v4(), "m1".into(), AnalysisType::ObjectDetection);
        let err = orchestrator.on_task_completed(&task).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskNotTerminal(_, TaskStatus::Pending)));
    }

    #[tokio::test]
    async fn on_task_completed_skips_registry_submission_for_manual_review() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, job_registry) = build_orchestrator(dir.path()).await;
        orchestrator.acquire_next_job().await.unwrap().unwrap();

        let queue_key = analysis_queue_key(AnalysisType::ObjectDetection);
        let task_ref = orchestrator.broker.dequeue(&queue_key, Duration::from_millis(100)).await.unwrap();
        let leased = orchestrator.store.lease_task(task_ref.task_id, "w1", chrono::Duration::seconds(60)).await.unwrap();
        let review = orchestrator.store.transition_task(leased.id, TaskStatus::Running, TaskStatus::ManualReview).await.unwrap();

        orchestrator.on_task_completed(&review).await.unwrap();

        assert_eq!(job_registry.submission_count(), 0, "manual_review tasks must not be reported per-task to the registry");
        assert_eq!(job_registry.report_count(), 1, "the process still completes and sends its final quality report");
    }

    #[tokio::test]
    async fn expand_and_enqueue_halts_once_breaker_tripped() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _job_registry) = build_orchestrator(dir.path()).await;
        let job = sample_job();
        let process = Process::new(job.client.id.clone(), job.project.id.clone(), 0, "{}".into(), "[]".into());
        orchestrator.store.create_process(&process).await.unwrap();

        // Trip the breaker for this process before expansion runs.
        for _ in 0..10 {
            orchestrator.failure_tracker.record(process.id, false).await;
        }
        assert!(orchestrator.failure_tracker.is_tripped(process.id).await);

        orchestrator
            .expand_and_enqueue(&process, &job, &[AnalysisType::ObjectDetection])
            .await
            .unwrap();

        let depth = orchestrator.broker.depth(&analysis_queue_key(AnalysisType::ObjectDetection)).await.unwrap();
        assert_eq!(depth, 0, "no tasks should enqueue once the breaker is already tripped");
    }
}
