//! The Analysis Worker: pulls a leased task off its analysis-type queue and
//! runs the four-step sequence from spec §4.D — materialize context, invoke
//! the vision model, parse the output, submit to QA.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use vq_clients::image_provider::ImageProvider;
use vq_clients::job_registry::{JobRegistryClient, MediaRef};
use vq_clients::vision_model::{GenerateParams, VisionModelClient};
use vq_core::domain::{AuditSeverity, Task, TaskStatus};
use vq_core::template::{self, PlaceholderSet};
use vq_registry::registry::ConfigRegistry;
use vq_store::StateStore;

const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;
const JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no analysis profile configured for type {0}")]
    MissingProfile(String),
    #[error("image fetch failed: {0}")]
    ImageFetch(String),
    #[error("template render failed: {0}")]
    Template(#[from] template::TemplateError),
    #[error("model invocation failed after retries: {0}")]
    ModelInvocation(String),
    #[error("store error: {0}")]
    Store(#[from] vq_store::StoreError),
}

/// Computes the delay before retry attempt `attempt` (1-indexed), applying
/// exponential backoff with up to ±25% jitter, per spec §4.D.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_secs = BASE_BACKOFF.as_secs_f64() * (BACKOFF_FACTOR as f64).powi(attempt as i32 - 1);
    let jitter = base_secs * JITTER_FRACTION;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}

pub struct AnalysisWorker {
    store: std::sync::Arc<StateStore>,
    registry: std::sync::Arc<ConfigRegistry>,
    image_provider: std::sync::Arc<dyn ImageProvider>,
    vision_model: std::sync::Arc<dyn VisionModelClient>,
    job_registry: std::sync::Arc<dyn JobRegistryClient>,
    worker_id: String,
}

impl AnalysisWorker {
    pub fn new(
        store: std::sync::Arc<StateStore>,
        registry: std::sync::Arc<ConfigRegistry>,
        image_provider: std::sync::Arc<dyn ImageProvider>,
        vision_model: std::sync::Arc<dyn VisionModelClient>,
        job_registry: std::sync::Arc<dyn JobRegistryClient>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            image_provider,
            vision_model,
            job_registry,
            worker_id: worker_id.into(),
        }
    }

    /// Runs the four-step analysis sequence against a task already leased
    /// from the broker. On success transitions the task to `AwaitingQa`
    /// with the parsed output recorded; on exhausted retries transitions it
    /// to `Failed` and records `last_error`.
    pub async fn process_task(&self, task: &Task, media: &MediaRef) -> Result<Task, WorkerError> {
        let profile = self
            .registry
            .get_analysis_profile(task.analysis_type)
            .ok_or_else(|| WorkerError::MissingProfile(task.analysis_type.slug().to_string()))?;

        let image_bytes = self
            .image_provider
            .fetch(media)
            .await
            .map_err(|e| WorkerError::ImageFetch(e.to_string()))?;

        use base64::Engine;
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&image_bytes);

        let mut declared = vec!["IMAGE".to_string()];
        declared.extend(profile.declared_placeholders.iter().cloned());
        let allowed = PlaceholderSet::from_declared(declared);

        let mut bindings: BTreeMap<&str, String> = BTreeMap::new();
        bindings.insert("IMAGE", image_b64);

        let system = template::render(&profile.system_prompt_template, &allowed, &bindings)?;
        let user = template::render(&profile.user_prompt_template, &allowed, &bindings)?;

        let params = GenerateParams {
            temperature: profile.temperature,
            num_ctx: profile.context_size,
            max_tokens: profile.max_output_size,
            ..GenerateParams::default()
        };

        let mut last_err = None;
        for attempt in 1..=MAX_RETRIES {
            let call = tokio::time::timeout(
                CALL_TIMEOUT,
                self.vision_model.generate(&profile.model, &system, &user, &image_bytes, &params),
            )
            .await;

            match call {
                Ok(Ok(result)) => {
                    info!(task = %task.id, attempt, "analysis call succeeded");
                    return self.submit_for_qa(task, result.structured_output).await;
                }
                Ok(Err(e)) => {
                    warn!(task = %task.id, attempt, error = %e, "analysis call failed");
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    warn!(task = %task.id, attempt, "analysis call timed out");
                    last_err = Some("call timed out".to_string());
                }
            }
            if attempt < MAX_RETRIES {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        let message = last_err.unwrap_or_else(|| "unknown failure".to_string());
        self.store
            .transition_task(task.id, TaskStatus::Running, TaskStatus::Failed)
            .await?;
        Err(WorkerError::ModelInvocation(message))
    }

    async fn submit_for_qa(&self, task: &Task, raw_output: serde_json::Value) -> Result<Task, WorkerError> {
        let path = format!("task/{}/raw_output.json", task.id);
        self.store.emit_audit(
            task.process_id,
            Some(task.id),
            "analysis_completed",
            AuditSeverity::Info,
            serde_json::json!({ "task_id": task.id, "raw_output_path": path, "raw_output": raw_output }),
            Uuid::new_v4(),
        ).await?;
        self.store.set_task_result(task.id, raw_output).await?;
        let updated = self.store.transition_task(task.id, TaskStatus::Running, TaskStatus::AwaitingQa).await?;
        Ok(updated)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter_band() {
        for attempt in 1..=3 {
            let delay = backoff_delay(attempt);
            let base = BASE_BACKOFF.as_secs_f64() * (BACKOFF_FACTOR as f64).powi(attempt as i32 - 1);
            let lo = base * (1.0 - JITTER_FRACTION);
            let hi = base * (1.0 + JITTER_FRACTION);
            let secs = delay.as_secs_f64();
            assert!(secs >= lo - 0.001 && secs <= hi + 0.001, "attempt {attempt}: {secs} not in [{lo}, {hi}]");
        }
    }

    #[test]
    fn backoff_attempt_two_roughly_doubles_attempt_one() {
        let a1 = backoff_delay(1).as_secs_f64();
        let a2 = backoff_delay(2).as_secs_f64();
        assert!(a2 > a1 * 1.2, "expected attempt 2 ({a2}) to be noticeably larger than attempt 1 ({a1})");
    }
}
