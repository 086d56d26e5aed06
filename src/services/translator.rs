use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::services::capabilities::{TranslateError, Translator};
use crate::services::workers_ai::WorkersAiClient;

/// Translator backed by a Workers AI translation model (m2m100 by default).
pub struct WorkersAiTranslator {
    client: Arc<WorkersAiClient>,
    model: String,
}

#[derive(Deserialize)]
struct TranslationResult {
    translated_text: Option<String>,
}

impl WorkersAiTranslator {
    pub fn new(client: Arc<WorkersAiClient>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Translator for WorkersAiTranslator {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        let body = serde_json::json!({
            "text": text,
            "source_lang": source_language,
            "target_lang": target_language,
        });

        let result: TranslationResult =
            self.client.run(&self.model, &body).await.map_err(|e| {
                if e.is_unavailable() {
                    TranslateError::Unavailable(e.to_string())
                } else {
                    TranslateError::Translation(e.to_string())
                }
            })?;

        match result.translated_text {
            Some(translated) if !translated.trim().is_empty() => Ok(translated),
            _ => Err(TranslateError::Translation(
                "model returned an empty translation".to_string(),
            )),
        }
    }
}
