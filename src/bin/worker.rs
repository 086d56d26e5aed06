use comic_to_speech::{
    config::AppConfig,
    db::{self, PgJobStore},
    models::job::JobKind,
    pipeline::{Capabilities, ExtractionStage, PipelineExecutor},
    services::{
        capabilities::{Extractor, Translator},
        encryption::EncryptionService,
        job_store::JobStore,
        narrator::VisionNarrator,
        ocr::CloudVisionOcr,
        queue::{Broker, RedisBroker},
        storage::{AssetStore, R2Client},
        translator::WorkersAiTranslator,
        tts::GoogleTts,
        workers_ai::WorkersAiClient,
    },
    worker::{HandlerRegistry, Worker, WorkerPool},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting comic-to-speech worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("WORKER_METRICS_ADDR is not a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    tracing::info!(%metrics_addr, "Serving worker metrics");
    metrics::describe_histogram!("pipeline_stage_seconds", "Duration of each pipeline stage");
    metrics::describe_histogram!("pipeline_job_seconds", "Duration of one job run");
    metrics::describe_counter!("pipeline_jobs_completed_total", "Jobs that reached Completed");
    metrics::describe_counter!("pipeline_jobs_failed_total", "Jobs that reached Failed");
    metrics::describe_counter!("extraction_fallback_total", "Extractions served by OCR after the narrator failed");
    metrics::describe_counter!("translation_degraded_total", "Translations degraded to pass-through");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");
    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");
    let assets = Arc::new(AssetStore::new(Arc::new(r2_client), encryption));

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(
            &config.redis_url,
            &config.queue_prefix,
            config.visibility_timeout(),
            config.poll_interval(),
        )
        .expect("Failed to initialize broker"),
    );

    tracing::info!("Initializing AI capabilities");
    let google_api_key = config
        .google_api_key
        .as_deref()
        .expect("GOOGLE_API_KEY is required by workers (OCR and speech synthesis)");

    let workers_ai = config.workers_ai_credentials().map(|(account, token)| {
        Arc::new(WorkersAiClient::new(account, token).expect("Failed to initialize Workers AI client"))
    });
    if workers_ai.is_none() {
        tracing::warn!("Workers AI credentials not set: narrator and translator disabled");
    }

    let primary: Option<Arc<dyn Extractor>> = workers_ai
        .clone()
        .map(|client| Arc::new(VisionNarrator::new(client, &config.narrator_model)) as Arc<dyn Extractor>);
    let translator: Option<Arc<dyn Translator>> = workers_ai
        .filter(|_| config.translation_enabled)
        .map(|client| {
            Arc::new(WorkersAiTranslator::new(client, &config.translator_model)) as Arc<dyn Translator>
        });

    let settings = config.pipeline_settings();
    let capabilities = Capabilities {
        extraction: ExtractionStage::new(
            primary,
            Arc::new(CloudVisionOcr::new(google_api_key).expect("Failed to initialize OCR client")),
            config.use_llm_narrator,
            settings.extraction_timeout,
        ),
        translator,
        synthesizer: Arc::new(GoogleTts::new(google_api_key).expect("Failed to initialize TTS client")),
    };

    let executor = Arc::new(PipelineExecutor::new(store.clone(), assets, capabilities, settings));
    let registry = HandlerRegistry::new().register(JobKind::ComicNarration, executor);

    let queues = config.worker_queues();
    let workers: Vec<Worker> = (1..=config.worker_count)
        .map(|n| {
            Worker::new(
                format!("{}-{n}", config.worker_id),
                broker.clone(),
                store.clone(),
                registry.clone(),
                queues.clone(),
                config.max_deliveries,
            )
            .expect("Handler registry is incomplete")
        })
        .collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::spawn(workers, shutdown_rx);
    tracing::info!(workers = pool.len(), queues = ?queues, "Worker pool ready");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, finishing in-flight jobs");
    shutdown_tx.send(true).ok();
    pool.join().await;
}
