pub mod health;
pub mod jobs;
pub mod metrics;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Multipart framing and option fields on top of the image itself.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Job and health routes, without the metrics endpoint or middleware.
pub fn api_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + FORM_OVERHEAD_BYTES;
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
