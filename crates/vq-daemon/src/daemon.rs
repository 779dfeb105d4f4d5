use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use vq_clients::image_provider::{HttpImageProvider, ImageProvider};
use vq_clients::job_registry::{HttpJobRegistryClient, JobRegistryClient, MediaRef};
use vq_clients::notification_sink::{NotificationSink, WebhookNotificationSink};
use vq_clients::vision_model::{HttpVisionModelClient, VisionModelClient};
use vq_core::config::Config;
use vq_core::domain::{AnalysisType, TaskStatus};
use vq_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use vq_orchestrator::{JobOrchestrator, OrchestratorError, ProcessFailureTracker};
use vq_pipeline::qa::{QaError, QaPipeline};
use vq_pipeline::worker::AnalysisWorker;
use vq_queue::broker::{analysis_queue_key, QueueError, TaskQueueBroker, TaskRef};
use vq_registry::file_watcher::{FileWatcher, FileWatcherConfig};
use vq_registry::registry::ConfigRegistry;
use vq_store::{StateStore, StoreError};

use crate::control_socket;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("qa error: {0}")]
    Qa(#[from] QaError),
    #[error("registry error: {0}")]
    Registry(#[from] vq_registry::registry::RegistryError),
}

/// Configuration for the daemon's background loop intervals. The job-poll
/// interval matches spec §4.F's "10s poll interval" default.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub job_poll_secs: u64,
    pub lease_reclaim_secs: u64,
    pub broker_reclaim_secs: u64,
    pub config_watch_poll_ms: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self {
            job_poll_secs: 10,
            lease_reclaim_secs: 15,
            broker_reclaim_secs: 15,
            config_watch_poll_ms: 500,
        }
    }
}

/// The vision-QA engine's background daemon. Owns the state store, queue
/// broker, config registry, and job orchestrator, and spawns the worker
/// pool, maintenance loops, config watcher, and control socket — all
/// coordinated by one [`ShutdownSignal`].
pub struct Daemon {
    config: Config,
    store: Arc<StateStore>,
    registry: Arc<ConfigRegistry>,
    broker: Arc<TaskQueueBroker>,
    orchestrator: Arc<JobOrchestrator>,
    image_provider: Arc<dyn ImageProvider>,
    vision_model: Arc<dyn VisionModelClient>,
    job_registry: Arc<dyn JobRegistryClient>,
    model_semaphore: Arc<Semaphore>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Builds every component from `config`: opens (or creates) the SQLite
    /// state store, loads the profile tree, and constructs the HTTP clients
    /// for the job registry, vision model runtime, image provider, and
    /// notification sink.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store_path = expand_home(&config.store.connection_string);
        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let store = Arc::new(StateStore::new(&store_path).await?);

        let registry = Arc::new(ConfigRegistry::load(&config.general.profile_config_dir)?);

        let broker = Arc::new(TaskQueueBroker::new(
            config.queue.depth_limit,
            lease_ttl(&config).to_std().unwrap_or(Duration::from_secs(300)),
        ));

        let job_registry: Arc<dyn JobRegistryClient> = Arc::new(HttpJobRegistryClient::new(
            config.registry.base_url.clone(),
            config.registry.api_key.clone(),
        ));
        let vision_model: Arc<dyn VisionModelClient> = Arc::new(HttpVisionModelClient::new(
            config.vision_model.base_url.clone(),
            Duration::from_secs(config.vision_model.call_timeout_secs),
        ));
        let image_provider: Arc<dyn ImageProvider> = Arc::new(HttpImageProvider::new());
        let notifications: Arc<dyn NotificationSink> =
            Arc::new(WebhookNotificationSink::new(webhook_urls(&config)));

        let failure_tracker = Arc::new(ProcessFailureTracker::new(
            20,
            config.worker.circuit_breaker_failure_rate,
        ));

        let orchestrator = Arc::new(JobOrchestrator::new(
            store.clone(),
            registry.clone(),
            broker.clone(),
            job_registry.clone(),
            notifications,
            failure_tracker,
            5,
        ));

        let model_semaphore = Arc::new(Semaphore::new(config.worker.vision_model_concurrency));

        Ok(Self {
            config,
            store,
            registry,
            broker,
            orchestrator,
            image_provider,
            vision_model,
            job_registry,
            model_semaphore,
            intervals: DaemonIntervals::default(),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConfigRegistry> {
        self.registry.clone()
    }

    /// Spawns the worker pool, maintenance loop, config watcher, and
    /// control socket as background tasks, then blocks until shutdown is
    /// triggered and every component confirms drain.
    pub async fn run(&self) -> anyhow::Result<()> {
        let worker_count = self.config.worker.count;
        info!(workers = worker_count, "starting analysis/QA worker pool");

        for i in 0..worker_count {
            let worker_id = format!("worker-{i}");
            let store = self.store.clone();
            let registry = self.registry.clone();
            let broker = self.broker.clone();
            let image_provider = self.image_provider.clone();
            let vision_model = self.vision_model.clone();
            let job_registry = self.job_registry.clone();
            let orchestrator = self.orchestrator.clone();
            let model_semaphore = self.model_semaphore.clone();
            let lease_ttl_duration = lease_ttl(&self.config);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                run_worker(
                    worker_id,
                    store,
                    registry,
                    broker,
                    image_provider,
                    vision_model,
                    job_registry,
                    orchestrator,
                    model_semaphore,
                    lease_ttl_duration,
                    shutdown,
                )
                .await;
            });
        }

        tokio::spawn(run_maintenance_loop(
            self.orchestrator.clone(),
            self.store.clone(),
            self.broker.clone(),
            self.intervals.clone(),
            self.shutdown.clone(),
        ));

        tokio::spawn(run_config_watch_loop(
            self.registry.clone(),
            self.config.general.profile_config_dir.clone(),
            self.intervals.config_watch_poll_ms,
            self.shutdown.clone(),
        ));

        let socket_path = control_socket::default_socket_path();
        let control_registry = self.registry.clone();
        let control_shutdown = self.shutdown.clone();
        let control_shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let _guard = ShutdownGuard::new(control_shutdown);
            if let Err(e) = control_socket::serve(&socket_path, control_registry, control_shutdown_rx).await {
                error!(error = %e, "control socket server exited with an error");
            }
        });

        let mut shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        shutdown_rx.recv().await.ok();
        info!("shutdown triggered, waiting for background tasks to drain");
        let drained = shutdown
            .wait_for_drain(worker_count + 3, Duration::from_secs(30))
            .await;
        if !drained.is_complete() {
            warn!("not all background tasks confirmed drain before timeout");
        }
        Ok(())
    }
}

fn lease_ttl(config: &Config) -> chrono::Duration {
    chrono::Duration::seconds(
        config.vision_model.call_timeout_secs as i64 * config.store.lease_ttl_multiplier as i64,
    )
}

fn webhook_urls(config: &Config) -> std::collections::HashMap<&'static str, String> {
    let mut map = std::collections::HashMap::new();
    let n = &config.notifications;
    for (key, url) in [
        ("batch_manifest", &n.batch_manifest_url),
        ("qa_structural", &n.qa_structural_url),
        ("qa_content", &n.qa_content_url),
        ("qa_domain", &n.qa_domain_url),
        ("batch_report", &n.batch_report_url),
    ] {
        if !url.is_empty() {
            map.insert(key, url.clone());
        }
    }
    map
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// One worker's main loop: round-robins over the 21 analysis queues,
/// leasing and fully processing one task per successful dequeue, then
/// checking shutdown before moving on.
#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: String,
    store: Arc<StateStore>,
    registry: Arc<ConfigRegistry>,
    broker: Arc<TaskQueueBroker>,
    image_provider: Arc<dyn ImageProvider>,
    vision_model: Arc<dyn VisionModelClient>,
    job_registry: Arc<dyn JobRegistryClient>,
    orchestrator: Arc<JobOrchestrator>,
    model_semaphore: Arc<Semaphore>,
    lease_ttl_duration: chrono::Duration,
    shutdown: ShutdownSignal,
) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let analysis_worker = AnalysisWorker::new(
        store.clone(),
        registry.clone(),
        image_provider.clone(),
        vision_model.clone(),
        job_registry,
        worker_id.clone(),
    );
    let qa_pipeline = QaPipeline::new(store.clone(), registry, vision_model, image_provider);
    let queue_keys: Vec<String> = AnalysisType::ALL.iter().map(|t| analysis_queue_key(*t)).collect();
    let poll_timeout = Duration::from_millis(250);

    info!(worker = %worker_id, "worker started");
    while !shutdown.is_shutting_down() {
        for queue_key in &queue_keys {
            if shutdown.is_shutting_down() {
                break;
            }
            let task_ref = match broker.dequeue(queue_key, poll_timeout).await {
                Ok(task_ref) => task_ref,
                Err(_) => continue,
            };
            if let Err(e) = process_one(
                &worker_id,
                &analysis_worker,
                &qa_pipeline,
                &orchestrator,
                &store,
                &broker,
                queue_key,
                &task_ref,
                &model_semaphore,
                lease_ttl_duration,
            )
            .await
            {
                error!(worker = %worker_id, task = %task_ref.task_id, error = %e, "task processing failed");
            }
        }
    }
    info!(worker = %worker_id, "worker stopped");
}

/// Leases one dequeued task, runs it through analysis and QA to a terminal
/// state, and reports the outcome to the orchestrator. Errors here are
/// store/queue-layer failures; task-level failures are absorbed into
/// `Failed`/`manual_review` transitions and still reported as completions.
#[allow(clippy::too_many_arguments)]
async fn process_one(
    worker_id: &str,
    analysis_worker: &AnalysisWorker,
    qa_pipeline: &QaPipeline,
    orchestrator: &JobOrchestrator,
    store: &StateStore,
    broker: &TaskQueueBroker,
    queue_key: &str,
    task_ref: &TaskRef,
    model_semaphore: &Semaphore,
    lease_ttl_duration: chrono::Duration,
) -> Result<(), DaemonError> {
    let leased = match store.lease_task(task_ref.task_id, worker_id, lease_ttl_duration).await {
        Ok(task) => task,
        Err(StoreError::LeaseConflict(_)) => {
            // Already leased by another worker (or reclaimed and re-leased
            // between dequeue and here) — ack and move on.
            broker.ack(queue_key, task_ref.task_id).await.ok();
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let process = store
        .get_process(leased.process_id)
        .await?
        .ok_or(StoreError::ProcessNotFound(leased.process_id))?;
    let media_refs: Vec<MediaRef> = serde_json::from_str(&process.media_refs).unwrap_or_default();

    let Some(media) = media_refs.iter().find(|m| m.id == leased.media_id) else {
        warn!(task = %leased.id, media_id = %leased.media_id, "no matching media entry for task, failing it");
        store.transition_task(leased.id, TaskStatus::Running, TaskStatus::Failed).await?;
        broker.ack(queue_key, task_ref.task_id).await.ok();
        let failed = store.get_task(leased.id).await?.ok_or(StoreError::TaskNotFound(leased.id))?;
        orchestrator.on_task_completed(&failed).await?;
        return Ok(());
    };

    let analyzed = {
        let _permit = model_semaphore.acquire().await.expect("semaphore never closed");
        analysis_worker.process_task(&leased, media).await
    };
    let analyzed = match analyzed {
        Ok(task) => task,
        Err(_) => {
            broker.ack(queue_key, task_ref.task_id).await.ok();
            let failed = store.get_task(leased.id).await?.ok_or(StoreError::TaskNotFound(leased.id))?;
            orchestrator.on_task_completed(&failed).await?;
            return Ok(());
        }
    };

    let output = analyzed.result.clone().unwrap_or(serde_json::Value::Null);
    let final_task = {
        let _permit = model_semaphore.acquire().await.expect("semaphore never closed");
        qa_pipeline.run(&analyzed, output, media).await?
    };

    broker.ack(queue_key, task_ref.task_id).await.ok();
    orchestrator.on_task_completed(&final_task).await?;
    Ok(())
}

/// Polls the registry for the next job, reclaims expired store leases, and
/// requeues broker inflight entries past their deadline — the three timers
/// behind the orchestrator's `tokio::select!` main loop from spec §4.F.
async fn run_maintenance_loop(
    orchestrator: Arc<JobOrchestrator>,
    store: Arc<StateStore>,
    broker: Arc<TaskQueueBroker>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut job_poll = tokio::time::interval(Duration::from_secs(intervals.job_poll_secs));
    let mut lease_reclaim = tokio::time::interval(Duration::from_secs(intervals.lease_reclaim_secs));
    let mut broker_reclaim = tokio::time::interval(Duration::from_secs(intervals.broker_reclaim_secs));
    job_poll.tick().await;
    lease_reclaim.tick().await;
    broker_reclaim.tick().await;

    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = job_poll.tick() => {
                match orchestrator.acquire_next_job().await {
                    Ok(Some(process)) => info!(process = %process.id, "acquired new job"),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "job acquisition failed"),
                }
            }
            _ = lease_reclaim.tick() => {
                match store.reclaim_expired(100).await {
                    Ok(n) if n > 0 => info!(count = n, "reclaimed expired task leases"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "lease reclaim failed"),
                }
            }
            _ = broker_reclaim.tick() => {
                let n = broker.reclaim_inflight().await;
                if n > 0 {
                    info!(count = n, "requeued expired inflight broker entries");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("maintenance loop shutting down");
                break;
            }
        }
    }
}

/// Drains the `notify`-backed file watcher on `config_dir` and calls
/// `registry.reload()` whenever a change is observed, per spec §6's
/// file-system-triggered reload path.
async fn run_config_watch_loop(
    registry: Arc<ConfigRegistry>,
    config_dir: String,
    poll_ms: u64,
    shutdown: ShutdownSignal,
) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut watcher = match FileWatcher::new(FileWatcherConfig {
        root_path: PathBuf::from(&config_dir),
        ..FileWatcherConfig::default()
    }) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to start config file watcher");
            return;
        }
    };
    if let Err(e) = watcher.add_watch(&config_dir) {
        error!(error = %e, dir = %config_dir, "failed to watch config directory");
        return;
    }

    let mut poll = tokio::time::interval(Duration::from_millis(poll_ms));
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let events = watcher.recv_events();
                if !events.is_empty() {
                    match registry.reload() {
                        Ok(generation) => info!(generation, changed = events.len(), "config reloaded from file watcher"),
                        Err(e) => warn!(error = %e, "config reload rejected, keeping previous snapshot"),
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("config watch loop shutting down");
                break;
            }
        }
    }
}
