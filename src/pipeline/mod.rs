//! Per-job orchestration: extract → translate? → synthesize.
//!
//! The executor persists each stage's results as soon as the stage finishes
//! and finishes every job it touches with a terminal write. Stage failures
//! never escape as errors: they become a fallback (extraction), a degrade
//! (translation) or a `Failed` record. Only infrastructure errors (job store,
//! object storage) are returned, and the worker leaves those deliveries
//! un-acked so the broker redelivers them.

pub mod extraction;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::job::{ErrorKind, Job, JobStatus, TranslationStatus, UpdateOutcome};
use crate::services::capabilities::{
    SynthesisError, Synthesizer, TranslateError, Translator,
};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::storage::{AssetError, AssetStore, StorageError};
use crate::worker::registry::JobHandler;

pub use extraction::{ExtractionFailure, ExtractionStage};

/// Per-stage limits and output settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub extraction_timeout: Duration,
    pub translation_timeout: Duration,
    pub synthesis_timeout: Duration,
    /// Audio URLs are `{audio_url_base}/{job_id}`.
    pub audio_url_base: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            extraction_timeout: Duration::from_secs(120),
            translation_timeout: Duration::from_secs(60),
            synthesis_timeout: Duration::from_secs(120),
            audio_url_base: "/api/audio".to_string(),
        }
    }
}

/// The capability implementations a pipeline runs with.
pub struct Capabilities {
    pub extraction: ExtractionStage,
    pub translator: Option<Arc<dyn Translator>>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Who is running a job, and on which delivery.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub worker_id: &'a str,
    pub attempt: u32,
}

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(ErrorKind),
    /// The record was already terminal when this run looked at it.
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Object storage error: {0}")]
    Storage(#[from] StorageError),
}

enum Step {
    Next(Job),
    Done(JobOutcome),
}

impl From<UpdateOutcome> for Step {
    fn from(outcome: UpdateOutcome) -> Self {
        match outcome {
            UpdateOutcome::Applied(job) => Step::Next(job),
            UpdateOutcome::Terminal(job) => Step::Done(JobOutcome::AlreadyTerminal(job.status)),
        }
    }
}

/// Run `future` with a deadline; a timeout becomes `on_timeout(limit)`.
pub(crate) async fn bounded<T, E>(
    limit: Duration,
    future: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}

/// Mark a job `Failed`. A no-op on records that are already terminal.
pub async fn record_failure(
    store: &dyn JobStore,
    job_id: Uuid,
    kind: ErrorKind,
    message: String,
) -> Result<UpdateOutcome, StoreError> {
    tracing::warn!(job_id = %job_id, error_kind = %kind, error = %message, "Job failed");
    let outcome = store
        .update(
            job_id,
            Box::new(move |job| {
                job.status = JobStatus::Failed;
                job.error_kind = Some(kind);
                job.error_message = Some(message);
            }),
        )
        .await?;

    if matches!(outcome, UpdateOutcome::Applied(_)) {
        metrics::counter!("pipeline_jobs_failed_total", "error_kind" => <&'static str>::from(kind))
            .increment(1);
    }
    Ok(outcome)
}

pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    assets: Arc<AssetStore>,
    capabilities: Capabilities,
    settings: PipelineSettings,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        assets: Arc<AssetStore>,
        capabilities: Capabilities,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            assets,
            capabilities,
            settings,
        }
    }

    /// Drive one job to a terminal status, resuming after whichever stage
    /// a previous delivery already persisted.
    pub async fn execute(
        &self,
        job_id: Uuid,
        ctx: RunContext<'_>,
    ) -> Result<JobOutcome, PipelineError> {
        let mut job = self.store.get(job_id).await?;
        if job.status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %job.status, "Job already terminal, skipping");
            return Ok(JobOutcome::AlreadyTerminal(job.status));
        }
        if job.status != JobStatus::Queued {
            tracing::info!(
                job_id = %job_id,
                status = %job.status,
                attempt = ctx.attempt,
                "Resuming redelivered job"
            );
        }

        let started = Instant::now();

        if job.narration_text.is_none() {
            job = match self.run_extraction(job, ctx).await? {
                Step::Next(job) => job,
                Step::Done(outcome) => return Ok(outcome),
            };
        }

        if job.translation_status.is_none() {
            job = match self.run_translation(job, ctx).await? {
                Step::Next(job) => job,
                Step::Done(outcome) => return Ok(outcome),
            };
        }

        let outcome = self.run_synthesis(job, ctx).await?;
        metrics::histogram!("pipeline_job_seconds").record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn transition(
        &self,
        job_id: Uuid,
        status: JobStatus,
        ctx: RunContext<'_>,
    ) -> Result<Step, PipelineError> {
        let outcome = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    job.status = status;
                    job.owner_worker_id = Some(ctx.worker_id.to_string());
                    job.attempts = ctx.attempt;
                }),
            )
            .await?;
        Ok(outcome.into())
    }

    async fn fail(&self, job_id: Uuid, kind: ErrorKind, message: String) -> Result<Step, PipelineError> {
        let outcome = record_failure(self.store.as_ref(), job_id, kind, message).await?;
        Ok(match outcome {
            UpdateOutcome::Applied(_) => Step::Done(JobOutcome::Failed(kind)),
            UpdateOutcome::Terminal(job) => Step::Done(JobOutcome::AlreadyTerminal(job.status)),
        })
    }

    async fn run_extraction(&self, job: Job, ctx: RunContext<'_>) -> Result<Step, PipelineError> {
        let job = match self.transition(job.id, JobStatus::Extracting, ctx).await? {
            Step::Next(job) => job,
            done => return Ok(done),
        };

        let image = match self.assets.load_image(&job.input_ref).await {
            Ok(image) => image,
            Err(AssetError::Storage(StorageError::NotFound(key))) => {
                return self
                    .fail(job.id, ErrorKind::InputUnavailable, format!("source image {key} not found"))
                    .await;
            }
            Err(AssetError::Storage(e)) => return Err(e.into()),
            Err(AssetError::Encryption(e)) => {
                return self
                    .fail(job.id, ErrorKind::InputUnavailable, e.to_string())
                    .await;
            }
        };

        let timer = Instant::now();
        let result = self
            .capabilities
            .extraction
            .run(&image, job.options.prefer_extractor)
            .await;
        metrics::histogram!("pipeline_stage_seconds", "stage" => "extraction")
            .record(timer.elapsed().as_secs_f64());

        let extraction = match result {
            Ok(extraction) => extraction,
            Err(failure) => {
                return self
                    .fail(job.id, ErrorKind::ExtractionFailed, failure.to_string())
                    .await;
            }
        };

        tracing::info!(
            job_id = %job.id,
            narration_mode = %extraction.mode,
            confidence = extraction.confidence,
            tokens_used = ?extraction.tokens_used,
            chars = extraction.text.len(),
            "Extraction complete"
        );

        let outcome = self
            .store
            .update(
                job.id,
                Box::new(move |j| {
                    j.narration_text = Some(extraction.text);
                    j.narration_mode = Some(extraction.mode);
                    j.extraction_confidence = Some(extraction.confidence);
                    j.tokens_used = extraction.tokens_used;
                    j.layout = extraction.layout;
                    j.translated_text = None;
                    j.translation_status = None;
                    j.translation_error = None;
                }),
            )
            .await?;
        Ok(outcome.into())
    }

    async fn run_translation(&self, job: Job, ctx: RunContext<'_>) -> Result<Step, PipelineError> {
        if !job.options.translate {
            let outcome = self
                .store
                .update(
                    job.id,
                    Box::new(|j| {
                        j.translated_text = None;
                        j.translation_status = Some(TranslationStatus::Skipped);
                        j.translation_error = None;
                    }),
                )
                .await?;
            return Ok(outcome.into());
        }
        if job.narration_text.as_deref().map_or(true, |text| text.trim().is_empty()) {
            return self
                .fail(job.id, ErrorKind::ValidationError, "no text to synthesize".to_string())
                .await;
        }

        let job = match self.transition(job.id, JobStatus::Translating, ctx).await? {
            Step::Next(job) => job,
            done => return Ok(done),
        };
        let narration = job.narration_text.clone().unwrap_or_default();
        let options = &job.options;

        let timer = Instant::now();
        let result = match &self.capabilities.translator {
            Some(translator) => {
                bounded(
                    self.settings.translation_timeout,
                    translator.translate(&narration, &options.source_language, &options.target_language),
                    TranslateError::Timeout,
                )
                .await
            }
            None => Err(TranslateError::Unavailable(
                "no translator configured".to_string(),
            )),
        };
        metrics::histogram!("pipeline_stage_seconds", "stage" => "translation")
            .record(timer.elapsed().as_secs_f64());

        let (text, status, error) = match result {
            Ok(translated) => {
                tracing::info!(
                    job_id = %job.id,
                    target_language = %options.target_language,
                    chars = translated.len(),
                    "Translation applied"
                );
                (translated, TranslationStatus::Applied, None)
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %e,
                    "Translation unavailable, continuing with source text"
                );
                metrics::counter!("translation_degraded_total").increment(1);
                (narration, TranslationStatus::Unavailable, Some(e.to_string()))
            }
        };

        let outcome = self
            .store
            .update(
                job.id,
                Box::new(move |j| {
                    j.translated_text = Some(text);
                    j.translation_status = Some(status);
                    j.translation_error = error;
                }),
            )
            .await?;
        Ok(outcome.into())
    }

    async fn run_synthesis(&self, job: Job, ctx: RunContext<'_>) -> Result<JobOutcome, PipelineError> {
        let text = job.speech_text().unwrap_or_default().to_string();
        if text.trim().is_empty() {
            return Ok(self.finish(
                self.fail(job.id, ErrorKind::ValidationError, "no text to synthesize".to_string())
                    .await?,
            ));
        }

        let job = match self.transition(job.id, JobStatus::Synthesizing, ctx).await? {
            Step::Next(job) => job,
            done => return Ok(self.finish(done)),
        };
        let options = &job.options;

        let timer = Instant::now();
        let result = bounded(
            self.settings.synthesis_timeout,
            self.capabilities
                .synthesizer
                .synthesize(&text, &options.voice, &options.language_code),
            SynthesisError::Timeout,
        )
        .await;
        metrics::histogram!("pipeline_stage_seconds", "stage" => "synthesis")
            .record(timer.elapsed().as_secs_f64());

        let clip = match result {
            Ok(clip) => clip,
            Err(e) => {
                return Ok(self.finish(
                    self.fail(job.id, ErrorKind::SynthesisFailed, e.to_string())
                        .await?,
                ));
            }
        };

        let audio_ref = match self.assets.put_audio(job.id, &clip).await {
            Ok(key) => key,
            Err(AssetError::Storage(e)) => return Err(e.into()),
            Err(AssetError::Encryption(e)) => {
                return Ok(self.finish(
                    self.fail(job.id, ErrorKind::SynthesisFailed, e.to_string())
                        .await?,
                ));
            }
        };
        let audio_url = format!(
            "{}/{}",
            self.settings.audio_url_base.trim_end_matches('/'),
            job.id
        );
        let characters = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);

        let outcome = self
            .store
            .update(
                job.id,
                Box::new(move |j| {
                    j.status = JobStatus::Completed;
                    j.audio_ref = Some(audio_ref);
                    j.audio_url = Some(audio_url);
                    j.characters_synthesized = Some(characters);
                }),
            )
            .await?;

        if let UpdateOutcome::Applied(done) = &outcome {
            metrics::counter!("pipeline_jobs_completed_total").increment(1);
            tracing::info!(
                job_id = %done.id,
                narration_mode = ?done.narration_mode,
                translation_status = ?done.translation_status,
                audio_ref = ?done.audio_ref,
                "Job completed"
            );
        }
        Ok(self.finish(outcome.into()))
    }

    fn finish(&self, step: Step) -> JobOutcome {
        match step {
            Step::Next(job) => match job.status {
                JobStatus::Completed => JobOutcome::Completed,
                status => JobOutcome::AlreadyTerminal(status),
            },
            Step::Done(outcome) => outcome,
        }
    }
}

#[async_trait]
impl JobHandler for PipelineExecutor {
    async fn handle(&self, job_id: Uuid, ctx: RunContext<'_>) -> Result<JobOutcome, PipelineError> {
        self.execute(job_id, ctx).await
    }
}
