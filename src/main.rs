use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use comic_to_speech::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgJobStore},
    routes::{self, metrics::MetricsState},
    services::{
        encryption::EncryptionService,
        jobs::JobService,
        queue::RedisBroker,
        storage::{AssetStore, R2Client},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing comic-to-speech gateway");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_submitted_total", "Jobs accepted and enqueued");
    metrics::describe_counter!(
        "jobs_enqueue_failed_total",
        "Jobs whose record was created but could not be enqueued"
    );
    metrics::describe_gauge!("queue_depth", "Messages waiting in each queue");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing R2 storage client");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let encryption =
        EncryptionService::new(&config.encryption_key).expect("Failed to initialize encryption");

    tracing::info!("Connecting to Redis broker");
    let broker = RedisBroker::new(
        &config.redis_url,
        &config.queue_prefix,
        config.visibility_timeout(),
        config.poll_interval(),
    )
    .expect("Failed to initialize broker");

    let jobs = JobService::new(
        Arc::new(PgJobStore::new(db_pool)),
        Arc::new(broker),
        Arc::new(AssetStore::new(Arc::new(r2_client), encryption)),
        config.queue_routing(),
    );
    let state = AppState::new(Arc::new(jobs), config.max_upload_bytes);

    let metrics_state = MetricsState {
        handle: prometheus_handle,
        jobs: state.jobs.clone(),
        queues: vec![config.default_queue.clone(), config.heavy_queue.clone()],
    };

    let app = Router::new()
        .merge(routes::api_router(state))
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(
            config.max_upload_bytes + 64 * 1024,
        ));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
