use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobStatus, NarrationMode, PageLayout, TranslationStatus};

/// Response after submitting a comic page.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Public view of a job record, as returned by `get_status`.
///
/// Internal bookkeeping (owner, storage keys, attempt count) is not exposed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration_mode: Option<NarrationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    /// Panel, bubble and text block counts from OCR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<PageLayout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation_status: Option<TranslationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characters_synthesized: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            narration_text: job.narration_text,
            narration_mode: job.narration_mode,
            extraction_confidence: job.extraction_confidence,
            tokens_used: job.tokens_used,
            layout: job.layout,
            translated_text: job.translated_text,
            translation_status: job.translation_status,
            translation_error: job.translation_error,
            audio_url: job.audio_url,
            characters_synthesized: job.characters_synthesized,
            error_kind: job.error_kind,
            error_message: job.error_message,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
