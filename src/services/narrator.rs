use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;

use crate::models::job::NarrationMode;
use crate::services::capabilities::{ExtractError, Extraction, Extractor};
use crate::services::workers_ai::{WorkersAiClient, WorkersAiError};

const NARRATION_PROMPT: &str = concat!(
    "You are narrating a comic page for an audiobook listener who cannot see it. ",
    "Read the panels in reading order. For each panel, briefly describe the scene ",
    "and the characters' expressions, then speak every line of dialogue, naming who ",
    "says it. Include captions and sound effects where they matter. ",
    "Write plain prose meant to be read aloud: no markdown, no lists, numbers ",
    "written as words, punctuation that gives natural pauses."
);

const MAX_TOKENS: u32 = 1000;

/// Primary extractor: vision-language narration through Workers AI.
pub struct VisionNarrator {
    client: Arc<WorkersAiClient>,
    model: String,
}

#[derive(Deserialize)]
struct NarrationResult {
    #[serde(alias = "description")]
    response: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: Option<u32>,
}

impl VisionNarrator {
    pub fn new(client: Arc<WorkersAiClient>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Extractor for VisionNarrator {
    fn mode(&self) -> NarrationMode {
        NarrationMode::Llm
    }

    async fn extract(&self, image: &[u8]) -> Result<Extraction, ExtractError> {
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
            "prompt": NARRATION_PROMPT,
            "max_tokens": MAX_TOKENS,
        });

        let result: NarrationResult = self
            .client
            .run(&self.model, &body)
            .await
            .map_err(extract_error)?;

        let text = result.response.unwrap_or_default().trim().to_string();
        tracing::debug!(
            model = %self.model,
            chars = text.len(),
            tokens = ?result.usage.as_ref().and_then(|u| u.total_tokens),
            "Narration received"
        );

        Ok(Extraction {
            text,
            mode: NarrationMode::Llm,
            // The model reports no confidence; narration is taken as-is.
            confidence: 1.0,
            tokens_used: result.usage.and_then(|u| u.total_tokens),
            layout: None,
        })
    }
}

fn extract_error(err: WorkersAiError) -> ExtractError {
    match err {
        WorkersAiError::Http(e) => ExtractError::Http(e),
        WorkersAiError::Api { status, message } => ExtractError::Api { status, message },
        WorkersAiError::Parse(message) => ExtractError::Parse(message),
    }
}
