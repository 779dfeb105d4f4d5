//! Client for the external job registry: the system of record for clients,
//! projects, and media, external to this engine (spec §6).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobRegistryError {
    #[error("http error: {0}")]
    Http(String),
    #[error("auth error (401)")]
    Unauthorized,
    #[error("no job available (404)")]
    NoJob,
    #[error("duplicate submission (400), non-retryable")]
    Duplicate,
    #[error("invalid submission (422), non-retryable: {0}")]
    Invalid(String),
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(u16, String),
    #[error("response parse error: {0}")]
    Parse(String),
}

impl JobRegistryError {
    /// Non-retryable errors must be surfaced to the caller as a terminal
    /// task failure rather than fed into the worker's retry loop.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobRegistryError::Duplicate | JobRegistryError::Invalid(_))
    }
}

impl From<reqwest::Error> for JobRegistryError {
    fn from(err: reqwest::Error) -> Self {
        JobRegistryError::Http(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientRef {
    pub id: String,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectRef {
    pub id: String,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaRef {
    pub id: String,
    pub filename: String,
    pub optimised_path: String,
    pub greyscale_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisRef {
    pub id: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NextJob {
    pub client: ClientRef,
    pub project: ProjectRef,
    pub media: Vec<MediaRef>,
    pub analyses: Vec<AnalysisRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Processing,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSubmission {
    #[serde(rename = "modelUsed")]
    pub model_used: String,
    #[serde(rename = "userPromptUsed")]
    pub user_prompt_used: String,
    #[serde(rename = "systemPromptUsed")]
    pub system_prompt_used: String,
    pub status: &'static str,
    #[serde(rename = "analysisResult")]
    pub analysis_result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportDetails {
    pub total_media_processed: u32,
    pub total_analyses_completed: u32,
    pub processing_time_minutes: f64,
    pub success_rate: f64,
    pub analysis_types_completed: Vec<String>,
    pub key_findings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub summary: String,
    pub details: ReportDetails,
}

/// The job registry's HTTP contract, abstracted so the orchestrator can be
/// tested against [`MockJobRegistryClient`] without a network dependency.
#[async_trait]
pub trait JobRegistryClient: Send + Sync {
    async fn next_job(&self) -> Result<Option<NextJob>, JobRegistryError>;
    async fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<(), JobRegistryError>;
    async fn submit_analysis(
        &self,
        project_id: &str,
        media_id: &str,
        analysis_id: &str,
        submission: &AnalysisSubmission,
    ) -> Result<(), JobRegistryError>;
    async fn submit_report(&self, project_id: &str, report: &QualityReport) -> Result<(), JobRegistryError>;
}

pub struct HttpJobRegistryClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpJobRegistryClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl JobRegistryClient for HttpJobRegistryClient {
    async fn next_job(&self) -> Result<Option<NextJob>, JobRegistryError> {
        let url = format!("{}/next-job", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => Ok(Some(resp.json().await.map_err(|e| JobRegistryError::Parse(e.to_string()))?)),
            404 => Ok(None),
            401 => Err(JobRegistryError::Unauthorized),
            status => Err(JobRegistryError::UnexpectedStatus(status, resp.text().await.unwrap_or_default())),
        }
    }

    async fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<(), JobRegistryError> {
        let url = format!("{}/projects/{}/status", self.base_url, project_id);
        let resp = self
            .client
            .put(&url)
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(JobRegistryError::UnexpectedStatus(resp.status().as_u16(), resp.text().await.unwrap_or_default()))
        }
    }

    async fn submit_analysis(
        &self,
        project_id: &str,
        media_id: &str,
        analysis_id: &str,
        submission: &AnalysisSubmission,
    ) -> Result<(), JobRegistryError> {
        let url = format!(
            "{}/projects/{}/media/{}/analysis/{}",
            self.base_url, project_id, media_id, analysis_id
        );
        let resp = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(submission)
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 201 => Ok(()),
            400 => Err(JobRegistryError::Duplicate),
            422 => Err(JobRegistryError::Invalid(resp.text().await.unwrap_or_default())),
            status => Err(JobRegistryError::UnexpectedStatus(status, resp.text().await.unwrap_or_default())),
        }
    }

    async fn submit_report(&self, project_id: &str, report: &QualityReport) -> Result<(), JobRegistryError> {
        let url = format!("{}/projects/{}/reports", self.base_url, project_id);
        let resp = self
            .client
            .put(&url)
            .header("X-API-Key", &self.api_key)
            .json(&serde_json::json!({ "type": "quality_analysis", "report": report }))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(JobRegistryError::UnexpectedStatus(resp.status().as_u16(), resp.text().await.unwrap_or_default()))
        }
    }
}

/// Test double: serves a pre-configured queue of jobs and records every
/// call made against it, mirroring the teacher's `MockProvider` pattern.
#[derive(Default)]
pub struct MockJobRegistryClient {
    jobs: Mutex<std::collections::VecDeque<NextJob>>,
    status_calls: Arc<Mutex<Vec<(String, ProjectStatus)>>>,
    submissions: Arc<Mutex<Vec<(String, String, String, AnalysisSubmission)>>>,
    reports: Arc<Mutex<Vec<(String, QualityReport)>>>,
    fail_next_submission: Mutex<Option<JobRegistryError>>,
}

impl MockJobRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(self, job: NextJob) -> Self {
        self.jobs.lock().unwrap().push_back(job);
        self
    }

    pub fn fail_next_submission_with(&self, err: JobRegistryError) {
        *self.fail_next_submission.lock().unwrap() = Some(err);
    }

    pub fn status_calls(&self) -> Vec<(String, ProjectStatus)> {
        self.status_calls.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

#[async_trait]
impl JobRegistryClient for MockJobRegistryClient {
    async fn next_job(&self) -> Result<Option<NextJob>, JobRegistryError> {
        Ok(self.jobs.lock().unwrap().pop_front())
    }

    async fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<(), JobRegistryError> {
        self.status_calls.lock().unwrap().push((project_id.to_string(), status));
        Ok(())
    }

    async fn submit_analysis(
        &self,
        project_id: &str,
        media_id: &str,
        analysis_id: &str,
        submission: &AnalysisSubmission,
    ) -> Result<(), JobRegistryError> {
        if let Some(err) = self.fail_next_submission.lock().unwrap().take() {
            return Err(err);
        }
        self.submissions.lock().unwrap().push((
            project_id.to_string(),
            media_id.to_string(),
            analysis_id.to_string(),
            submission.clone(),
        ));
        Ok(())
    }

    async fn submit_report(&self, project_id: &str, report: &QualityReport) -> Result<(), JobRegistryError> {
        self.reports.lock().unwrap().push((project_id.to_string(), report.clone()));
        Ok(())
    }
}
