//! Test helper utilities: scripted capabilities and an in-process harness.

#![allow(dead_code)]

use async_trait::async_trait;
use comic_to_speech::{
    models::job::{Job, JobKind, JobOptions, JobStatus, NarrationMode, PageLayout, UpdateOutcome},
    models::status::JobStatusView,
    pipeline::{Capabilities, ExtractionStage, PipelineExecutor, PipelineSettings},
    services::{
        capabilities::{
            ExtractError, Extraction, Extractor, SynthesisError, Synthesizer, TranslateError,
            Translator,
        },
        encryption::EncryptionService,
        job_store::{JobMutator, JobStore, MemoryJobStore, StoreError},
        jobs::{JobService, QueueRouting},
        queue::MemoryBroker,
        storage::{AssetStore, AudioClip, BlobStore, MemoryBlobStore, StorageError},
    },
    worker::{HandlerRegistry, Worker, WorkerPool},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Tracks how many jobs are between extraction start and synthesis end.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub enum ExtractScript {
    Text(String),
    Fail,
    Hang,
}

pub struct ScriptedExtractor {
    mode: NarrationMode,
    script: ExtractScript,
    delay: Duration,
    layout: Option<PageLayout>,
    calls: AtomicUsize,
    in_flight: Option<Arc<InFlight>>,
}

impl ScriptedExtractor {
    pub fn new(mode: NarrationMode, script: ExtractScript) -> Self {
        Self {
            mode,
            script,
            delay: Duration::ZERO,
            layout: None,
            calls: AtomicUsize::new(0),
            in_flight: None,
        }
    }

    pub fn text(mode: NarrationMode, text: &str) -> Self {
        Self::new(mode, ExtractScript::Text(text.to_string()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn tracking(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = Some(in_flight);
        self
    }

    pub fn with_layout(mut self, layout: PageLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    fn mode(&self) -> NarrationMode {
        self.mode
    }

    async fn extract(&self, _image: &[u8]) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(in_flight) = &self.in_flight {
            in_flight.enter();
        }
        tokio::time::sleep(self.delay).await;
        match &self.script {
            ExtractScript::Text(text) => Ok(Extraction {
                text: text.clone(),
                mode: self.mode,
                confidence: 0.9,
                tokens_used: Some(42),
                layout: self.layout,
            }),
            ExtractScript::Fail => Err(ExtractError::Api {
                status: 503,
                message: "scripted failure".to_string(),
            }),
            ExtractScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ExtractError::NoText)
            }
        }
    }
}

pub enum TranslateScript {
    /// Prefix the input with `[target] `.
    Tag,
    /// Prefix the input with `[target #n] `, `n` counting calls from 1.
    Numbered,
    Unavailable,
    Fail,
}

pub struct ScriptedTranslator {
    script: TranslateScript,
    calls: AtomicUsize,
}

impl ScriptedTranslator {
    pub fn new(script: TranslateScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslateError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script {
            TranslateScript::Tag => Ok(format!("[{target_language}] {text}")),
            TranslateScript::Numbered => Ok(format!("[{target_language} #{call}] {text}")),
            TranslateScript::Unavailable => {
                Err(TranslateError::Unavailable("model not loaded".to_string()))
            }
            TranslateScript::Fail => Err(TranslateError::Translation("garbled".to_string())),
        }
    }
}

/// Synthesizer that records every request and returns the text as "audio".
pub struct RecordingSynthesizer {
    fail: bool,
    delay: Duration,
    requests: Mutex<Vec<(String, String, String)>>,
    in_flight: Option<Arc<InFlight>>,
}

impl RecordingSynthesizer {
    pub fn new() -> Self {
        Self {
            fail: false,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            in_flight: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn tracking(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = Some(in_flight);
        self
    }

    /// `(text, voice, language)` of every call, in order.
    pub fn requests(&self) -> Vec<(String, String, String)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Synthesizer for RecordingSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        language: &str,
    ) -> Result<AudioClip, SynthesisError> {
        self.requests
            .lock()
            .unwrap()
            .push((text.to_string(), voice.to_string(), language.to_string()));
        tokio::time::sleep(self.delay).await;
        if let Some(in_flight) = &self.in_flight {
            in_flight.leave();
        }
        if self.fail {
            return Err(SynthesisError::Api {
                status: 500,
                message: "scripted failure".to_string(),
            });
        }
        Ok(AudioClip {
            bytes: text.as_bytes().to_vec(),
            content_type: "audio/mpeg".to_string(),
            extension: "mp3".to_string(),
        })
    }
}

/// Which write a [`CrashingStore`] loses.
#[derive(Clone, Copy)]
pub enum CrashPoint {
    /// The `Completed` write, as if the worker died right after synthesis.
    TerminalWrite,
    /// The write recording the translation result.
    TranslationWrite,
}

impl CrashPoint {
    fn hit(self, before: &Job, after: &Job) -> bool {
        match self {
            CrashPoint::TerminalWrite => after.status == JobStatus::Completed,
            CrashPoint::TranslationWrite => {
                before.translation_status.is_none() && after.translation_status.is_some()
            }
        }
    }
}

/// Job store that loses the first write matching its [`CrashPoint`] and
/// reports the store as unavailable.
pub struct CrashingStore {
    inner: MemoryJobStore,
    point: CrashPoint,
    armed: AtomicBool,
    crashes: AtomicUsize,
}

impl CrashingStore {
    pub fn new() -> Self {
        Self::crashing_on(CrashPoint::TerminalWrite)
    }

    pub fn crashing_on(point: CrashPoint) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            point,
            armed: AtomicBool::new(true),
            crashes: AtomicUsize::new(0),
        }
    }

    pub fn crashes(&self) -> usize {
        self.crashes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for CrashingStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, id: Uuid, mutator: JobMutator<'_>) -> Result<UpdateOutcome, StoreError> {
        let crashed = AtomicBool::new(false);
        let armed = &self.armed;
        let point = self.point;
        let crashed_ref = &crashed;
        let outcome = self
            .inner
            .update(
                id,
                Box::new(move |job: &mut Job| {
                    let before = job.clone();
                    mutator(job);
                    if point.hit(&before, job) && armed.swap(false, Ordering::SeqCst) {
                        *job = before;
                        crashed_ref.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await?;

        if crashed.load(Ordering::SeqCst) {
            self.crashes.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        Ok(outcome)
    }

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.exists(id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Object storage whose first `failures` audio uploads get an HTTP 503.
pub struct FlakyBlobStore {
    inner: Arc<MemoryBlobStore>,
    failures: AtomicUsize,
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let failing = key.starts_with("audio/")
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            return Err(StorageError::Http {
                status: 503,
                key: key.to_string(),
            });
        }
        self.inner.put(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

/// Parts of a harness; every field has a working default.
pub struct HarnessConfig {
    pub primary: Option<Arc<ScriptedExtractor>>,
    pub fallback: Arc<ScriptedExtractor>,
    pub primary_enabled: bool,
    pub translator: Option<Arc<ScriptedTranslator>>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub store: Arc<dyn JobStore>,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
    pub settings: PipelineSettings,
    /// Audio uploads that fail before storage recovers.
    pub audio_put_failures: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            primary: Some(Arc::new(ScriptedExtractor::text(
                NarrationMode::Llm,
                "Panel one. The cat says: hello there.",
            ))),
            fallback: Arc::new(ScriptedExtractor::text(NarrationMode::Ocr, "HELLO THERE")),
            primary_enabled: true,
            translator: Some(Arc::new(ScriptedTranslator::new(TranslateScript::Tag))),
            synthesizer: Arc::new(RecordingSynthesizer::new()),
            store: Arc::new(MemoryJobStore::new()),
            visibility_timeout: Duration::from_secs(5),
            max_deliveries: 3,
            settings: PipelineSettings {
                extraction_timeout: Duration::from_millis(200),
                translation_timeout: Duration::from_millis(200),
                synthesis_timeout: Duration::from_secs(2),
                audio_url_base: "https://audio.example.test".to_string(),
            },
            audio_put_failures: 0,
        }
    }
}

pub struct Harness {
    pub service: Arc<JobService>,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<MemoryBroker>,
    pub blobs: Arc<MemoryBlobStore>,
    pub registry: HandlerRegistry,
    pub max_deliveries: u32,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        let broker = Arc::new(MemoryBroker::new(
            config.visibility_timeout,
            Duration::from_millis(5),
        ));
        let blobs = Arc::new(MemoryBlobStore::new());
        let flaky = Arc::new(FlakyBlobStore {
            inner: blobs.clone(),
            failures: AtomicUsize::new(config.audio_put_failures),
        });
        let encryption = EncryptionService::new(&EncryptionService::generate_key()).unwrap();
        let assets = Arc::new(AssetStore::new(flaky, encryption));

        let capabilities = Capabilities {
            extraction: ExtractionStage::new(
                config.primary.map(|p| p as Arc<dyn Extractor>),
                config.fallback,
                config.primary_enabled,
                config.settings.extraction_timeout,
            ),
            translator: config.translator.map(|t| t as Arc<dyn Translator>),
            synthesizer: config.synthesizer,
        };
        let executor = Arc::new(PipelineExecutor::new(
            config.store.clone(),
            assets.clone(),
            capabilities,
            config.settings,
        ));
        let registry = HandlerRegistry::new().register(JobKind::ComicNarration, executor);

        let service = Arc::new(JobService::new(
            config.store.clone(),
            broker.clone(),
            assets,
            QueueRouting::default(),
        ));

        Self {
            service,
            store: config.store,
            broker,
            blobs,
            registry,
            max_deliveries: config.max_deliveries,
        }
    }

    pub fn worker(&self, id: &str) -> Worker {
        Worker::new(
            id,
            self.broker.clone(),
            self.store.clone(),
            self.registry.clone(),
            vec!["default".to_string(), "heavy".to_string()],
            self.max_deliveries,
        )
        .unwrap()
    }

    /// Start `count` workers. Drop or send `true` on the sender to stop them.
    pub fn start_workers(&self, count: usize) -> (watch::Sender<bool>, WorkerPool) {
        let (tx, rx) = watch::channel(false);
        let workers = (1..=count).map(|n| self.worker(&format!("w{n}"))).collect();
        (tx, WorkerPool::spawn(workers, rx))
    }

    pub async fn submit(&self, options: JobOptions) -> Uuid {
        self.service.submit_job(b"page", options).await.unwrap()
    }

    /// Poll until the job is `Completed` or `Failed`.
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> JobStatusView {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let view = self.service.get_status(job_id).await.unwrap();
                if view.status.is_terminal() {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not reach a terminal status in time")
    }
}

pub fn translate_options() -> JobOptions {
    JobOptions {
        translate: true,
        ..JobOptions::default()
    }
}
