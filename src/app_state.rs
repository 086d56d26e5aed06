use std::sync::Arc;

use crate::services::jobs::JobService;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(jobs: Arc<JobService>, max_upload_bytes: usize) -> Self {
        Self {
            jobs,
            max_upload_bytes,
        }
    }
}
