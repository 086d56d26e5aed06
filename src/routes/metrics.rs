use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::jobs::JobService;
use crate::services::queue::Broker;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub jobs: Arc<JobService>,
    /// Queues whose depth is sampled on every scrape.
    pub queues: Vec<String>,
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    for queue in &state.queues {
        match state.jobs.broker().depth(queue).await {
            Ok(depth) => {
                metrics::gauge!("queue_depth", "queue" => queue.clone()).set(depth as f64);
            }
            Err(e) => tracing::warn!(queue = %queue, error = %e, "Failed to sample queue depth"),
        }
    }
    state.handle.render()
}
