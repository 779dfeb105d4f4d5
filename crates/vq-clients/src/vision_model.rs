//! Client for the local vision model runtime (spec §6): a single
//! `generate()` operation invoked with either the analysis model or the
//! QA/correction model.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionModelError {
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("model runtime returned error (status {status}): {message}")]
    ModelError { status: u16, message: String },
    #[error("response parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for VisionModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VisionModelError::Timeout
        } else {
            VisionModelError::Http(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub num_ctx: u32,
    pub max_tokens: u32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            top_k: 40,
            num_ctx: 8192,
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResult {
    pub structured_output: serde_json::Value,
    pub raw_text: String,
}

/// The vision model runtime's `generate()` operation, abstracted behind a
/// trait so the analysis and QA workers can be exercised without a running
/// model backend.
#[async_trait]
pub trait VisionModelClient: Send + Sync {
    async fn generate(
        &self,
        model_name: &str,
        system: &str,
        user: &str,
        image_bytes: &[u8],
        params: &GenerateParams,
    ) -> Result<GenerateResult, VisionModelError>;
}

pub struct HttpVisionModelClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVisionModelClient {
    pub fn new(base_url: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(call_timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct RuntimeResponse {
    structured_output: serde_json::Value,
    #[serde(default)]
    raw_text: String,
}

#[async_trait]
impl VisionModelClient for HttpVisionModelClient {
    async fn generate(
        &self,
        model_name: &str,
        system: &str,
        user: &str,
        image_bytes: &[u8],
        params: &GenerateParams,
    ) -> Result<GenerateResult, VisionModelError> {
        use base64::Engine;
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);

        let body = serde_json::json!({
            "model": model_name,
            "system": system,
            "user": user,
            "image": image_b64,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "top_k": params.top_k,
            "num_ctx": params.num_ctx,
            "max_tokens": params.max_tokens,
        });

        let url = format!("{}/generate", self.base_url);
        let resp = self.client.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(VisionModelError::ModelError { status, message });
        }

        let parsed: RuntimeResponse = resp.json().await.map_err(|e| VisionModelError::Parse(e.to_string()))?;
        Ok(GenerateResult {
            structured_output: parsed.structured_output,
            raw_text: parsed.raw_text,
        })
    }
}

/// Test double returning a pre-configured queue of results or errors.
pub struct MockVisionModelClient {
    responses: Mutex<VecDeque<Result<GenerateResult, VisionModelError>>>,
    calls: Mutex<Vec<(String, String, String)>>,
}

impl MockVisionModelClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(self, result: GenerateResult) -> Self {
        self.responses.lock().unwrap().push_back(Ok(result));
        self
    }

    pub fn with_error(self, err: VisionModelError) -> Self {
        self.responses.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockVisionModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisionModelClient for MockVisionModelClient {
    async fn generate(
        &self,
        model_name: &str,
        system: &str,
        user: &str,
        _image_bytes: &[u8],
        _params: &GenerateParams,
    ) -> Result<GenerateResult, VisionModelError> {
        self.calls
            .lock()
            .unwrap()
            .push((model_name.to_string(), system.to_string(), user.to_string()));

        let mut queue = self.responses.lock().unwrap();
        queue.pop_front().unwrap_or_else(|| {
            Ok(GenerateResult {
                structured_output: serde_json::json!({}),
                raw_text: String::new(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_returns_default_when_queue_empty() {
        let client = MockVisionModelClient::new();
        let result = client
            .generate("vision-analysis", "sys", "user", b"bytes", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(result.structured_output, serde_json::json!({}));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn mock_returns_queued_response() {
        let client = MockVisionModelClient::new().with_response(GenerateResult {
            structured_output: serde_json::json!({"objects": []}),
            raw_text: "raw".into(),
        });
        let result = client
            .generate("vision-analysis", "sys", "user", b"bytes", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(result.structured_output, serde_json::json!({"objects": []}));
    }

    #[tokio::test]
    async fn mock_returns_queued_error() {
        let client = MockVisionModelClient::new().with_error(VisionModelError::Timeout);
        let err = client
            .generate("vision-qa", "sys", "user", b"bytes", &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VisionModelError::Timeout));
    }

    #[test]
    fn generate_params_defaults_are_sane() {
        let params = GenerateParams::default();
        assert!(params.temperature >= 0.0);
        assert!(params.max_tokens > 0);
    }
}
