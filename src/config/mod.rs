use serde::Deserialize;
use std::time::Duration;

use crate::pipeline::PipelineSettings;
use crate::services::jobs::QueueRouting;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by workers.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the broker
    pub redis_url: String,

    /// Prefix for every broker key in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Queue for jobs that request translation
    #[serde(default = "default_heavy_queue")]
    pub heavy_queue: String,

    /// Queues a worker listens on, comma-separated, highest priority first
    #[serde(default = "default_worker_queues")]
    pub worker_queues: Vec<String>,

    /// Worker id prefix; workers in one process are numbered `{id}-{n}`
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Prometheus scrape address for worker processes
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// Workers per worker process
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Deliveries allowed before a job is failed with `DeliveryExhausted`
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_timeout_secs: u64,

    #[serde(default = "default_translation_timeout_secs")]
    pub translation_timeout_secs: u64,

    #[serde(default = "default_synthesis_timeout_secs")]
    pub synthesis_timeout_secs: u64,

    /// Cloudflare account ID (narrator and translator)
    pub cf_account_id: Option<String>,

    /// Cloudflare Workers AI API token
    pub cf_api_token: Option<String>,

    #[serde(default = "default_narrator_model")]
    pub narrator_model: String,

    #[serde(default = "default_translator_model")]
    pub translator_model: String,

    /// Set to false to go straight to OCR for every job
    #[serde(default = "default_true")]
    pub use_llm_narrator: bool,

    /// Set to false to run without a translator (translations degrade to pass-through)
    #[serde(default = "default_true")]
    pub translation_enabled: bool,

    /// Google Cloud API key (Vision OCR and Text-to-Speech)
    pub google_api_key: Option<String>,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// AES-256-GCM encryption key (base64-encoded, 32 bytes)
    pub encryption_key: String,

    /// Public prefix for audio URLs
    #[serde(default = "default_audio_url_base")]
    pub audio_url_base: String,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_prefix() -> String {
    "comic".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_heavy_queue() -> String {
    "heavy".to_string()
}

fn default_worker_queues() -> Vec<String> {
    vec![default_queue(), default_heavy_queue()]
}

fn default_worker_id() -> String {
    "worker".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_worker_count() -> usize {
    1
}

fn default_visibility_timeout_secs() -> u64 {
    900
}

fn default_max_deliveries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_extraction_timeout_secs() -> u64 {
    120
}

fn default_translation_timeout_secs() -> u64 {
    60
}

fn default_synthesis_timeout_secs() -> u64 {
    120
}

fn default_narrator_model() -> String {
    "@cf/meta/llama-3.2-11b-vision-instruct".to_string()
}

fn default_translator_model() -> String {
    "@cf/meta/m2m100-1.2b".to_string()
}

fn default_true() -> bool {
    true
}

fn default_audio_url_base() -> String {
    "/api/audio".to_string()
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_deliveries == 0 {
            return Err(ConfigError::Invalid("MAX_DELIVERIES must be at least 1".to_string()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.worker_queues.iter().all(|q| q.trim().is_empty()) {
            return Err(ConfigError::Invalid("WORKER_QUEUES is empty".to_string()));
        }

        // A lease must outlive one full run, both extractors included.
        let stages = self.extraction_timeout_secs * 2
            + self.translation_timeout_secs
            + self.synthesis_timeout_secs;
        if self.visibility_timeout_secs <= stages {
            return Err(ConfigError::Invalid(format!(
                "VISIBILITY_TIMEOUT_SECS ({}) must exceed the sum of stage timeouts ({stages})",
                self.visibility_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_queues(&self) -> Vec<String> {
        self.worker_queues
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect()
    }

    pub fn queue_routing(&self) -> QueueRouting {
        QueueRouting {
            default_queue: self.default_queue.clone(),
            heavy_queue: self.heavy_queue.clone(),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            extraction_timeout: Duration::from_secs(self.extraction_timeout_secs),
            translation_timeout: Duration::from_secs(self.translation_timeout_secs),
            synthesis_timeout: Duration::from_secs(self.synthesis_timeout_secs),
            audio_url_base: self.audio_url_base.clone(),
        }
    }

    /// Workers AI credentials, when both are set.
    pub fn workers_ai_credentials(&self) -> Option<(&str, &str)> {
        match (&self.cf_account_id, &self.cf_api_token) {
            (Some(account), Some(token)) if !account.is_empty() && !token.is_empty() => {
                Some((account, token))
            }
            _ => None,
        }
    }
}
