use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const API_BASE: &str = "https://api.cloudflare.com/client/v4/accounts";

/// Client for Cloudflare Workers AI model invocations.
pub struct WorkersAiClient {
    http: Client,
    base_url: String,
    api_token: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, WorkersAiError> {
        Self::with_base_url(&format!("{API_BASE}/{account_id}/ai/run"), api_token)
    }

    /// Point the client at a different endpoint (gateway, proxy, local mock).
    pub fn with_base_url(base_url: &str, api_token: &str) -> Result<Self, WorkersAiError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }

    /// Run `model` with a JSON body and decode the `result` field.
    pub async fn run<T: DeserializeOwned>(
        &self,
        model: &str,
        body: &serde_json::Value,
    ) -> Result<T, WorkersAiError> {
        let url = format!("{}/{}", self.base_url, model.trim_start_matches('/'));

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let envelope: Envelope<T> = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                WorkersAiError::Parse(e.to_string())
            } else {
                WorkersAiError::Api {
                    status: status.as_u16(),
                    message: truncate(&text, 200),
                }
            }
        })?;

        if !status.is_success() || !envelope.success {
            let message = envelope
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(WorkersAiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        envelope
            .result
            .ok_or_else(|| WorkersAiError::Parse("response has no result".to_string()))
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum WorkersAiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Workers AI returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse Workers AI response: {0}")]
    Parse(String),
}

impl WorkersAiError {
    /// Model not deployed, service overloaded, or endpoint unreachable.
    pub fn is_unavailable(&self) -> bool {
        match self {
            WorkersAiError::Http(e) => e.is_connect() || e.is_timeout(),
            WorkersAiError::Api { status, .. } => matches!(status, 404 | 429 | 503),
            WorkersAiError::Parse(_) => false,
        }
    }
}
