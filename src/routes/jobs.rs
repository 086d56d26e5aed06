use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{JobOptions, JobStatus, NarrationMode};
use crate::models::status::{JobStatusView, SubmitResponse};
use crate::services::job_store::StoreError;
use crate::services::jobs::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unsupported image format")]
    UnsupportedMediaType,

    #[error("Image exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Service unavailable")]
    Unavailable,

    #[error("Internal error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::InvalidOptions(msg) => ApiError::BadRequest(msg),
            ServiceError::EmptyImage => ApiError::BadRequest(e.to_string()),
            ServiceError::Store(StoreError::NotFound(id)) => ApiError::NotFound(id),
            ServiceError::Enqueue { job_id, source } => {
                tracing::error!(job_id = %job_id, error = %source, "Enqueue failed");
                ApiError::Unavailable
            }
            other => {
                tracing::error!(error = %other, "Request failed");
                ApiError::Internal
            }
        }
    }
}

fn parse_field<T: FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid value for {name}: {value}")))
}

/// POST /api/v1/jobs: upload a comic page for narration.
///
/// Multipart fields: `image` (required) plus any of `translate`,
/// `source_language`, `target_language`, `voice`, `language_code`,
/// `prefer_extractor`.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut page: Option<Vec<u8>> = None;
    let mut options = JobOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            if data.len() > state.max_upload_bytes {
                return Err(ApiError::PayloadTooLarge(state.max_upload_bytes));
            }
            image::guess_format(&data).map_err(|_| ApiError::UnsupportedMediaType)?;
            page = Some(data.to_vec());
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        match name.as_str() {
            "translate" => options.translate = parse_field(&name, &value)?,
            "source_language" => options.source_language = value,
            "target_language" => options.target_language = value,
            "voice" => options.voice = value,
            "language_code" => options.language_code = value,
            "prefer_extractor" => {
                options.prefer_extractor = parse_field::<NarrationMode>(&name, &value)?
            }
            _ => tracing::debug!(field = %name, "Ignoring unknown form field"),
        }
    }

    let page = page.ok_or_else(|| ApiError::BadRequest("Missing image field".to_string()))?;
    let job_id = state.jobs.submit_job(&page, options).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
            message: "Comic page queued for narration".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: current state of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    Ok(Json(state.jobs.get_status(job_id).await?))
}
