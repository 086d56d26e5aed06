use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Lifecycle status of a comic-to-speech job.
///
/// Statuses only move forward: `Queued → Extracting → (Translating) →
/// Synthesizing → Completed`, or from any non-terminal status to `Failed`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
pub enum JobStatus {
    Queued,
    Extracting,
    Translating,
    Synthesizing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Extracting => 1,
            JobStatus::Translating => 2,
            JobStatus::Synthesizing => 3,
            JobStatus::Completed | JobStatus::Failed => 4,
        }
    }

    /// Whether a record in `self` may be written with status `next`.
    ///
    /// Staying in the same non-terminal status is allowed so a redelivered
    /// attempt can resume the stage it crashed in.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed => true,
            JobStatus::Completed => self == JobStatus::Synthesizing,
            JobStatus::Queued => self == JobStatus::Queued,
            _ => next.rank() >= self.rank(),
        }
    }
}

/// Which extractor produced the narration text.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NarrationMode {
    /// Vision-language narration (primary).
    #[default]
    Llm,
    /// Conventional OCR (fallback).
    Ocr,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TranslationStatus {
    Applied,
    Unavailable,
    Skipped,
}

/// Reason recorded on a `Failed` job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
pub enum ErrorKind {
    /// Both the primary and the fallback extractor failed.
    ExtractionFailed,
    /// Pre-flight check failed before an external call (e.g. nothing to speak).
    ValidationError,
    /// Speech synthesis failed; there is no fallback.
    SynthesisFailed,
    /// The stored source image could not be decrypted.
    InputUnavailable,
    /// The broker redelivered the job more often than allowed.
    DeliveryExhausted,
    /// The record was created but the broker refused the message.
    EnqueueFailed,
}

/// Kind of work a queued message asks for. Each kind maps to one handler.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    /// Extract → translate? → synthesize.
    ComicNarration,
}

/// Caller-supplied options for a job.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct JobOptions {
    #[garde(skip)]
    #[serde(default)]
    pub translate: bool,

    #[garde(length(min = 2, max = 16))]
    #[serde(default = "default_source_language")]
    pub source_language: String,

    #[garde(length(min = 2, max = 16))]
    #[serde(default = "default_target_language")]
    pub target_language: String,

    #[garde(length(min = 1, max = 64))]
    #[serde(default = "default_voice")]
    pub voice: String,

    #[garde(length(min = 2, max = 16))]
    #[serde(default = "default_language_code")]
    pub language_code: String,

    #[garde(skip)]
    #[serde(default)]
    pub prefer_extractor: NarrationMode,
}

fn default_source_language() -> String {
    "en".to_string()
}

fn default_target_language() -> String {
    "nl".to_string()
}

fn default_voice() -> String {
    "en-US-Neural2-F".to_string()
}

fn default_language_code() -> String {
    "en-US".to_string()
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            translate: false,
            source_language: default_source_language(),
            target_language: default_target_language(),
            voice: default_voice(),
            language_code: default_language_code(),
            prefer_extractor: NarrationMode::default(),
        }
    }
}

/// Page structure reported by OCR.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageLayout {
    /// Words with a detected bounding box.
    pub text_blocks: u32,
    /// Vision text blocks, roughly one per speech bubble or caption.
    pub bubble_count: u32,
    /// Groups of nearby bubbles.
    pub panel_count: u32,
}

/// A comic-to-speech job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub input_ref: String,
    pub options: JobOptions,

    pub narration_text: Option<String>,
    pub narration_mode: Option<NarrationMode>,
    pub extraction_confidence: Option<f64>,
    pub tokens_used: Option<u32>,
    pub layout: Option<PageLayout>,

    pub translated_text: Option<String>,
    pub translation_status: Option<TranslationStatus>,
    pub translation_error: Option<String>,

    pub audio_ref: Option<String>,
    pub audio_url: Option<String>,
    pub characters_synthesized: Option<u32>,

    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,

    pub owner_worker_id: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an atomic read-modify-write on a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The mutation was applied; carries the new record.
    Applied(Job),
    /// The job was already terminal; carries the untouched record.
    Terminal(Job),
}

impl UpdateOutcome {
    pub fn job(&self) -> &Job {
        match self {
            UpdateOutcome::Applied(job) | UpdateOutcome::Terminal(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            UpdateOutcome::Applied(job) | UpdateOutcome::Terminal(job) => job,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TransitionError {
    #[error("Job {id}: illegal status transition {from} -> {to}")]
    Illegal {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0}: immutable field changed")]
    Immutable(Uuid),
}

impl Job {
    pub fn new(kind: JobKind, input_ref: String, options: JobOptions) -> Self {
        Self::with_id(Uuid::new_v4(), kind, input_ref, options)
    }

    pub fn with_id(id: Uuid, kind: JobKind, input_ref: String, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status: JobStatus::Queued,
            input_ref,
            options,
            narration_text: None,
            narration_mode: None,
            extraction_confidence: None,
            tokens_used: None,
            layout: None,
            translated_text: None,
            translation_status: None,
            translation_error: None,
            audio_ref: None,
            audio_url: None,
            characters_synthesized: None,
            error_kind: None,
            error_message: None,
            owner_worker_id: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Text handed to the synthesizer: the translation when one was
    /// recorded, otherwise the narration.
    pub fn speech_text(&self) -> Option<&str> {
        self.translated_text
            .as_deref()
            .or(self.narration_text.as_deref())
    }

    /// Apply `mutator` under the store's lock.
    ///
    /// Terminal records are returned untouched. Backward status moves and
    /// changes to identity fields are rejected and leave `self` unchanged.
    pub fn apply<F>(&mut self, mutator: F) -> Result<UpdateOutcome, TransitionError>
    where
        F: FnOnce(&mut Job),
    {
        if self.status.is_terminal() {
            return Ok(UpdateOutcome::Terminal(self.clone()));
        }

        let mut next = self.clone();
        mutator(&mut next);

        if next.id != self.id || next.created_at != self.created_at || next.kind != self.kind {
            return Err(TransitionError::Immutable(self.id));
        }
        if next.status != self.status && !self.status.can_transition_to(next.status) {
            return Err(TransitionError::Illegal {
                id: self.id,
                from: self.status,
                to: next.status,
            });
        }
        if next.status != JobStatus::Failed {
            next.error_kind = None;
            next.error_message = None;
        }

        next.updated_at = Utc::now();
        *self = next;
        Ok(UpdateOutcome::Applied(self.clone()))
    }
}
