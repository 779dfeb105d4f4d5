//! The QA Pipeline: runs T1 (structural), T2 (content_quality), and T3
//! (domain_expert) in order against a task's analysis output, invoking
//! tier-scoped corrective generation on failure, per spec §4.E.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use vq_clients::image_provider::ImageProvider;
use vq_clients::job_registry::MediaRef;
use vq_clients::vision_model::{GenerateParams, VisionModelClient};
use vq_core::domain::{
    QaAttempt, QaOutcome, QaTier, Task, TaskStatus, MAX_QA_ATTEMPTS_PER_TIER,
};
use vq_core::template::{self, PlaceholderSet};
use vq_registry::profile::CorrectiveProfile;
use vq_registry::registry::ConfigRegistry;
use vq_store::StateStore;

const T2_TEMPERATURE: f32 = 0.05;

#[derive(Debug, Error)]
pub enum QaError {
    #[error("store error: {0}")]
    Store(#[from] vq_store::StoreError),
    #[error("no corrective profile configured for {0}/{1}")]
    MissingCorrectiveProfile(String, String),
    #[error("template render failed: {0}")]
    Template(#[from] template::TemplateError),
    #[error("model invocation failed: {0}")]
    ModelInvocation(String),
    #[error("image fetch failed: {0}")]
    ImageFetch(String),
}

/// Outcome of a single tier validator run, independent of the corrective
/// loop wrapping it.
pub struct TierResult {
    pub outcome: QaOutcome,
    pub failure_categories: Vec<String>,
    pub confidence: Option<f64>,
}

/// T1: purely local structural validation against the profile's declared
/// output schema. No network calls — target latency under 100ms.
pub fn run_structural_tier(output: &serde_json::Value, schema: &serde_json::Value) -> TierResult {
    let mut failures = Vec::new();

    if let (Some(required), Some(obj)) = (
        schema.get("required").and_then(|r| r.as_array()),
        output.as_object(),
    ) {
        for field in required {
            if let Some(name) = field.as_str() {
                if !obj.contains_key(name) {
                    failures.push(format!("missing_field:{name}"));
                }
            }
        }
    } else if schema.get("required").is_some() && !output.is_object() {
        failures.push("not_an_object".to_string());
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        if let Some(obj) = output.as_object() {
            for (key, spec) in props {
                let Some(value) = obj.get(key) else { continue };
                if let Some(expected_type) = spec.get("type").and_then(|t| t.as_str()) {
                    let matches = match expected_type {
                        "string" => value.is_string(),
                        "number" => value.is_number(),
                        "integer" => value.is_i64() || value.is_u64(),
                        "boolean" => value.is_boolean(),
                        "array" => value.is_array(),
                        "object" => value.is_object(),
                        _ => true,
                    };
                    if !matches {
                        failures.push(format!("type_mismatch:{key}"));
                    }
                }
                if let (Some(max_len), Some(arr)) = (spec.get("maxItems").and_then(|v| v.as_u64()), value.as_array()) {
                    if arr.len() as u64 > max_len {
                        failures.push(format!("array_too_long:{key}"));
                    }
                }
            }
        }
    }

    if failures.is_empty() {
        TierResult { outcome: QaOutcome::Pass, failure_categories: vec![], confidence: Some(1.0) }
    } else {
        TierResult { outcome: QaOutcome::Fail, failure_categories: failures, confidence: Some(0.0) }
    }
}

/// T2: scans for prohibited phrasing and meta-descriptive/first-person
/// language the profile's prohibited-phrase list names.
fn scan_prohibited_phrases(text: &str, prohibited: &[String]) -> Vec<String> {
    let lowered = text.to_lowercase();
    prohibited
        .iter()
        .filter(|p| lowered.contains(&p.to_lowercase()))
        .map(|p| format!("prohibited_phrase:{p}"))
        .collect()
}

pub struct QaPipeline {
    store: std::sync::Arc<StateStore>,
    registry: std::sync::Arc<ConfigRegistry>,
    vision_model: std::sync::Arc<dyn VisionModelClient>,
    image_provider: std::sync::Arc<dyn ImageProvider>,
}

impl QaPipeline {
    pub fn new(
        store: std::sync::Arc<StateStore>,
        registry: std::sync::Arc<ConfigRegistry>,
        vision_model: std::sync::Arc<dyn VisionModelClient>,
        image_provider: std::sync::Arc<dyn ImageProvider>,
    ) -> Self {
        Self { store, registry, vision_model, image_provider }
    }

    /// Runs the full T1 -> T2 -> T3 sequence for a task freshly arrived in
    /// `awaiting_qa`, applying the corrective loop at each tier. Returns the
    /// task's final state: `completed` or `manual_review`.
    pub async fn run(&self, task: &Task, mut output: serde_json::Value, media: &MediaRef) -> Result<Task, QaError> {
        let profile = self
            .registry
            .get_analysis_profile(task.analysis_type)
            .expect("analysis profile must exist for a task already past analysis");

        let image_bytes = self
            .image_provider
            .fetch(media)
            .await
            .map_err(|e| QaError::ImageFetch(e.to_string()))?;
        use base64::Engine;
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&image_bytes);

        for tier in QaTier::ORDER {
            let mut attempt_index = task.attempts_for(tier);
            loop {
                let result = match tier {
                    QaTier::Structural => run_structural_tier(&output, &profile.output_schema),
                    QaTier::ContentQuality => {
                        self.run_content_quality_tier(task, &output, &image_b64, &image_bytes).await?
                    }
                    QaTier::DomainExpert => {
                        self.run_domain_expert_tier(task, &output, &image_b64, &image_bytes).await?
                    }
                };

                self.store
                    .record_qa_attempt(&QaAttempt::new(task.id, tier, attempt_index + 1, result.outcome))
                    .await?;

                match result.outcome {
                    QaOutcome::Pass => {
                        info!(task = %task.id, tier = tier.slug(), "qa tier passed");
                        break;
                    }
                    QaOutcome::Fail => {
                        warn!(task = %task.id, tier = tier.slug(), categories = ?result.failure_categories, "qa tier failed");
                        attempt_index += 1;
                        if attempt_index >= MAX_QA_ATTEMPTS_PER_TIER {
                            return Ok(self
                                .store
                                .transition_task(task.id, TaskStatus::AwaitingQa, TaskStatus::ManualReview)
                                .await?);
                        }
                        output = self
                            .run_corrective(task, tier, &output, &result.failure_categories, &image_b64, &image_bytes)
                            .await?;
                    }
                }
            }
        }

        self.store.set_task_result(task.id, output).await?;
        Ok(self.store.transition_task(task.id, TaskStatus::AwaitingQa, TaskStatus::Completed).await?)
    }

    /// Renders a corrective profile's own prompt pair, shared by both the
    /// T2/T3 validator call and the rewrite call in [`Self::run_corrective`].
    fn render_corrective_prompt(
        corrective: &CorrectiveProfile,
        image_b64: &str,
        prior_output: &str,
        failure_categories: &str,
    ) -> Result<(String, String), QaError> {
        let mut declared = vec!["IMAGE".to_string(), "PRIOR_OUTPUT".to_string()];
        declared.extend(corrective.declared_placeholders.iter().cloned());
        let allowed = PlaceholderSet::from_declared(declared);

        let mut bindings: BTreeMap<&str, String> = BTreeMap::new();
        bindings.insert("IMAGE", image_b64.to_string());
        bindings.insert("PRIOR_OUTPUT", prior_output.to_string());
        bindings.insert("FAILURE_CATEGORIES", failure_categories.to_string());

        let system = template::render(&corrective.system_prompt_template, &allowed, &bindings)?;
        let user = template::render(&corrective.user_prompt_template, &allowed, &bindings)?;
        Ok((system, user))
    }

    async fn run_content_quality_tier(
        &self,
        task: &Task,
        output: &serde_json::Value,
        image_b64: &str,
        image_bytes: &[u8],
    ) -> Result<TierResult, QaError> {
        let profile = self
            .registry
            .get_analysis_profile(task.analysis_type)
            .expect("analysis profile must exist");
        let local_failures = scan_prohibited_phrases(&output.to_string(), &profile.prohibited_phrases);
        if !local_failures.is_empty() {
            return Ok(TierResult { outcome: QaOutcome::Fail, failure_categories: local_failures, confidence: Some(0.0) });
        }

        let corrective = self
            .registry
            .get_corrective_profile(task.analysis_type, QaTier::ContentQuality)
            .ok_or_else(|| {
                QaError::MissingCorrectiveProfile(task.analysis_type.slug().to_string(), QaTier::ContentQuality.slug().to_string())
            })?;
        let (system, user) = Self::render_corrective_prompt(&corrective, image_b64, &output.to_string(), "")?;

        let params = GenerateParams {
            temperature: T2_TEMPERATURE,
            num_ctx: corrective.context_size,
            max_tokens: corrective.max_output_size,
            ..GenerateParams::default()
        };
        let result = self
            .vision_model
            .generate(&corrective.model, &system, &user, image_bytes, &params)
            .await
            .map_err(|e| QaError::ModelInvocation(e.to_string()))?;

        let passed = result
            .structured_output
            .get("pass")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let categories = result
            .structured_output
            .get("issue_categories")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|c| c.as_str().map(String::from)).collect())
            .unwrap_or_default();

        Ok(if passed {
            TierResult { outcome: QaOutcome::Pass, failure_categories: vec![], confidence: Some(1.0) }
        } else {
            TierResult { outcome: QaOutcome::Fail, failure_categories: categories, confidence: Some(0.0) }
        })
    }

    async fn run_domain_expert_tier(
        &self,
        task: &Task,
        output: &serde_json::Value,
        image_b64: &str,
        image_bytes: &[u8],
    ) -> Result<TierResult, QaError> {
        let corrective = self
            .registry
            .get_corrective_profile(task.analysis_type, QaTier::DomainExpert)
            .ok_or_else(|| {
                QaError::MissingCorrectiveProfile(task.analysis_type.slug().to_string(), QaTier::DomainExpert.slug().to_string())
            })?;
        let (system, user) = Self::render_corrective_prompt(&corrective, image_b64, &output.to_string(), "")?;

        let params = GenerateParams {
            num_ctx: corrective.context_size,
            max_tokens: corrective.max_output_size,
            ..GenerateParams::default()
        };
        let result = self
            .vision_model
            .generate(&corrective.model, &system, &user, image_bytes, &params)
            .await
            .map_err(|e| QaError::ModelInvocation(e.to_string()))?;

        let confidence = result
            .structured_output
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        Ok(if confidence >= corrective.confidence_threshold as f64 {
            TierResult { outcome: QaOutcome::Pass, failure_categories: vec![], confidence: Some(confidence) }
        } else {
            TierResult {
                outcome: QaOutcome::Fail,
                failure_categories: vec!["confidence_below_threshold".to_string()],
                confidence: Some(confidence),
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_corrective(
        &self,
        task: &Task,
        tier: QaTier,
        prior_output: &serde_json::Value,
        failure_categories: &[String],
        image_b64: &str,
        image_bytes: &[u8],
    ) -> Result<serde_json::Value, QaError> {
        let corrective: CorrectiveProfile = self
            .registry
            .get_corrective_profile(task.analysis_type, tier)
            .ok_or_else(|| QaError::MissingCorrectiveProfile(task.analysis_type.slug().to_string(), tier.slug().to_string()))?;

        let (system, user) = Self::render_corrective_prompt(
            &corrective,
            image_b64,
            &prior_output.to_string(),
            &failure_categories.join(","),
        )?;

        let result = self
            .vision_model
            .generate(&corrective.model, &system, &user, image_bytes, &GenerateParams {
                temperature: corrective.temperature,
                num_ctx: corrective.context_size,
                max_tokens: corrective.max_output_size,
                ..GenerateParams::default()
            })
            .await
            .map_err(|e| QaError::ModelInvocation(e.to_string()))?;

        Ok(result.structured_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "required": ["label", "tags"],
            "properties": {
                "label": {"type": "string"},
                "tags": {"type": "array", "maxItems": 5},
            }
        })
    }

    #[test]
    fn structural_tier_passes_well_formed_output() {
        let output = serde_json::json!({"label": "cat", "tags": ["animal"]});
        let result = run_structural_tier(&output, &schema());
        assert!(matches!(result.outcome, QaOutcome::Pass));
    }

    #[test]
    fn structural_tier_fails_on_missing_field() {
        let output = serde_json::json!({"label": "cat"});
        let result = run_structural_tier(&output, &schema());
        assert!(matches!(result.outcome, QaOutcome::Fail));
        assert!(result.failure_categories.iter().any(|c| c.contains("tags")));
    }

    #[test]
    fn structural_tier_fails_on_type_mismatch() {
        let output = serde_json::json!({"label": 5, "tags": []});
        let result = run_structural_tier(&output, &schema());
        assert!(matches!(result.outcome, QaOutcome::Fail));
        assert!(result.failure_categories.iter().any(|c| c.contains("label")));
    }

    #[test]
    fn structural_tier_fails_on_array_too_long() {
        let output = serde_json::json!({"label": "cat", "tags": ["a", "b", "c", "d", "e", "f"]});
        let result = run_structural_tier(&output, &schema());
        assert!(matches!(result.outcome, QaOutcome::Fail));
        assert!(result.failure_categories.iter().any(|c| c.contains("array_too_long")));
    }

    #[test]
    fn prohibited_phrase_scan_is_case_insensitive() {
        let prohibited = vec!["I cannot".to_string()];
        let hits = scan_prohibited_phrases("As an AI, I CANNOT determine this.", &prohibited);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn prohibited_phrase_scan_clean_text_passes() {
        let prohibited = vec!["I cannot".to_string()];
        let hits = scan_prohibited_phrases("The image shows a red car.", &prohibited);
        assert!(hits.is_empty());
    }
}
