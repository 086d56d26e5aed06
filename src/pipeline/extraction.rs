use std::sync::Arc;
use std::time::Duration;

use crate::models::job::NarrationMode;
use crate::services::capabilities::{ExtractError, Extraction, Extractor};

use super::bounded;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionFailure {
    /// Only the fallback was eligible, and it failed.
    #[error("fallback: {fallback}")]
    Fallback { fallback: String },

    #[error("primary: {primary}; fallback: {fallback}")]
    Both { primary: String, fallback: String },
}

enum ExtractionState<'a> {
    PrimaryAttempt(&'a dyn Extractor),
    FallbackAttempt { primary_error: Option<String> },
}

/// Primary-then-fallback extraction.
///
/// The primary narrator is tried first unless it is missing, disabled, or
/// the job asked for OCR. Any primary failure (error, timeout, blank text)
/// moves to the fallback. The fallback's result is final, including an empty
/// page; the executor's pre-synthesis check deals with that.
pub struct ExtractionStage {
    primary: Option<Arc<dyn Extractor>>,
    fallback: Arc<dyn Extractor>,
    primary_enabled: bool,
    timeout: Duration,
}

impl ExtractionStage {
    pub fn new(
        primary: Option<Arc<dyn Extractor>>,
        fallback: Arc<dyn Extractor>,
        primary_enabled: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            primary_enabled,
            timeout,
        }
    }

    pub async fn run(
        &self,
        image: &[u8],
        preference: NarrationMode,
    ) -> Result<Extraction, ExtractionFailure> {
        let mut state = match (&self.primary, preference) {
            (Some(primary), NarrationMode::Llm) if self.primary_enabled => {
                ExtractionState::PrimaryAttempt(primary.as_ref())
            }
            _ => ExtractionState::FallbackAttempt {
                primary_error: None,
            },
        };

        loop {
            state = match state {
                ExtractionState::PrimaryAttempt(primary) => match self.attempt(primary, image).await {
                    Ok(extraction) if !extraction.text.trim().is_empty() => return Ok(extraction),
                    Ok(_) => {
                        tracing::warn!("Primary extractor returned no text, falling back to OCR");
                        metrics::counter!("extraction_fallback_total", "reason" => "empty").increment(1);
                        ExtractionState::FallbackAttempt {
                            primary_error: Some(ExtractError::NoText.to_string()),
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Primary extractor failed, falling back to OCR");
                        metrics::counter!("extraction_fallback_total", "reason" => "error").increment(1);
                        ExtractionState::FallbackAttempt {
                            primary_error: Some(e.to_string()),
                        }
                    }
                },
                ExtractionState::FallbackAttempt { primary_error } => {
                    return self
                        .attempt(self.fallback.as_ref(), image)
                        .await
                        .map_err(|e| match primary_error {
                            Some(primary) => ExtractionFailure::Both {
                                primary,
                                fallback: e.to_string(),
                            },
                            None => ExtractionFailure::Fallback {
                                fallback: e.to_string(),
                            },
                        });
                }
            };
        }
    }

    async fn attempt(
        &self,
        extractor: &dyn Extractor,
        image: &[u8],
    ) -> Result<Extraction, ExtractError> {
        let mut extraction =
            bounded(self.timeout, extractor.extract(image), ExtractError::Timeout).await?;
        extraction.mode = extractor.mode();
        Ok(extraction)
    }
}
