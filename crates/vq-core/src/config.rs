//! Runtime configuration: environment inputs per spec §6 ("registry base URL
//! and API key; model runtime address; state-store and queue-store
//! connection strings; worker count; log level. No positional arguments.").

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub vision_model: VisionModelConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            vision_model: VisionModelConfig::default(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            general: GeneralConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Config {
    /// Load config from the path given by `VQ_CONFIG_PATH`, or
    /// `~/.vision-qa/config.toml`, falling back to defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("VQ_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(path)
        } else {
            let mut cfg = Config::default();
            cfg.apply_env_overrides();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".vision-qa").join("config.toml")
    }

    /// Environment variables always win over the config file, matching
    /// spec §6's listing of environment inputs as the primary operator
    /// surface (there are no positional CLI arguments for these values).
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VQ_REGISTRY_BASE_URL") {
            self.registry.base_url = v;
        }
        if let Ok(v) = std::env::var("VQ_REGISTRY_API_KEY") {
            self.registry.api_key = v;
        }
        if let Ok(v) = std::env::var("VQ_MODEL_RUNTIME_ADDRESS") {
            self.vision_model.base_url = v;
        }
        if let Ok(v) = std::env::var("VQ_STORE_PATH") {
            self.store.connection_string = v;
        }
        if let Ok(v) = std::env::var("VQ_WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                self.worker.count = n;
            }
        }
        if let Ok(v) = std::env::var("RUST_LOG") {
            self.general.log_level = v;
        }
        if let Ok(v) = std::env::var("VQ_WEBHOOK_BATCH_MANIFEST") {
            self.notifications.batch_manifest_url = v;
        }
        if let Ok(v) = std::env::var("VQ_WEBHOOK_QA_STRUCTURAL") {
            self.notifications.qa_structural_url = v;
        }
        if let Ok(v) = std::env::var("VQ_WEBHOOK_QA_CONTENT") {
            self.notifications.qa_content_url = v;
        }
        if let Ok(v) = std::env::var("VQ_WEBHOOK_QA_DOMAIN") {
            self.notifications.qa_domain_url = v;
        }
        if let Ok(v) = std::env::var("VQ_WEBHOOK_BATCH_REPORT") {
            self.notifications.batch_report_url = v;
        }
    }

    /// Fatal-at-startup checks, not the Configuration Registry's profile
    /// validation (see `vq-registry`) — this only guards the runtime
    /// environment inputs themselves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.base_url.is_empty() {
            return Err(ConfigError::Invalid("registry.base_url must not be empty".into()));
        }
        if self.worker.count == 0 {
            return Err(ConfigError::Invalid("worker.count must be >= 1".into()));
        }
        if self.worker.vision_model_concurrency == 0 {
            return Err(ConfigError::Invalid("worker.vision_model_concurrency must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_base_url(),
            api_key: String::new(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_registry_base_url() -> String {
    "http://localhost:4000".into()
}
fn default_poll_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionModelConfig {
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,
    #[serde(default = "default_qa_model")]
    pub qa_model: String,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for VisionModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_base_url(),
            analysis_model: default_analysis_model(),
            qa_model: default_qa_model(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_model_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_analysis_model() -> String {
    "vision-analysis".into()
}
fn default_qa_model() -> String {
    "vision-qa".into()
}
fn default_call_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub connection_string: String,
    #[serde(default = "default_lease_ttl_multiplier")]
    pub lease_ttl_multiplier: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { connection_string: default_store_path(), lease_ttl_multiplier: default_lease_ttl_multiplier() }
    }
}

fn default_store_path() -> String {
    "~/.vision-qa/state.db".into()
}
fn default_lease_ttl_multiplier() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_depth_limit")]
    pub depth_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { depth_limit: default_queue_depth_limit() }
    }
}

fn default_queue_depth_limit() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_vision_model_concurrency")]
    pub vision_model_concurrency: usize,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_failure_rate: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            vision_model_concurrency: default_vision_model_concurrency(),
            circuit_breaker_failure_rate: default_circuit_breaker_threshold(),
        }
    }
}

fn default_worker_count() -> usize {
    8
}
fn default_vision_model_concurrency() -> usize {
    8
}
fn default_circuit_breaker_threshold() -> f64 {
    0.30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_config_dir")]
    pub profile_config_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), profile_config_dir: default_config_dir() }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_config_dir() -> String {
    "config".into()
}

/// Webhook URLs for the five notification channels named in spec §6. Any
/// channel left blank is simply skipped at delivery time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub batch_manifest_url: String,
    #[serde(default)]
    pub qa_structural_url: String,
    #[serde(default)]
    pub qa_content_url: String,
    #[serde(default)]
    pub qa_domain_url: String,
    #[serde(default)]
    pub batch_report_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.worker.count, 8);
        assert_eq!(cfg.worker.vision_model_concurrency, 8);
        assert_eq!(cfg.registry.poll_interval_secs, 10);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.worker.count, cfg.worker.count);
        assert_eq!(parsed.registry.base_url, cfg.registry.base_url);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let partial = r#"
[registry]
base_url = "http://registry.internal"
"#;
        let cfg: Config = toml::from_str(partial).unwrap();
        assert_eq!(cfg.registry.base_url, "http://registry.internal");
        assert_eq!(cfg.worker.count, 8);
    }

    #[test]
    fn zero_workers_is_invalid() {
        let mut cfg = Config::default();
        cfg.worker.count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_registry_url_is_invalid() {
        let mut cfg = Config::default();
        cfg.registry.base_url = String::new();
        assert!(cfg.validate().is_err());
    }
}
