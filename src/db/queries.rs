use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{Job, JobOptions, PageLayout};
use crate::services::job_store::StoreError;

const JOB_COLUMNS: &str = r#"
    id, kind, status, input_ref, options,
    narration_text, narration_mode, extraction_confidence, tokens_used, layout,
    translated_text, translation_status, translation_error,
    audio_ref, audio_url, characters_synthesized,
    error_kind, error_message,
    owner_worker_id, attempts, created_at, updated_at
"#;

/// Insert a new job record
pub async fn insert_job<'e>(executor: impl PgExecutor<'e>, job: &Job) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (
            id, kind, status, input_ref, options,
            narration_text, narration_mode, extraction_confidence, tokens_used, layout,
            translated_text, translation_status, translation_error,
            audio_ref, audio_url, characters_synthesized,
            error_kind, error_message,
            owner_worker_id, attempts, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(job.id)
    .bind(job.kind.to_string())
    .bind(job.status.to_string())
    .bind(&job.input_ref)
    .bind(Json(&job.options))
    .bind(&job.narration_text)
    .bind(job.narration_mode.map(|m| m.to_string()))
    .bind(job.extraction_confidence)
    .bind(job.tokens_used.map(i64::from))
    .bind(job.layout.map(Json))
    .bind(&job.translated_text)
    .bind(job.translation_status.map(|s| s.to_string()))
    .bind(&job.translation_error)
    .bind(&job.audio_ref)
    .bind(&job.audio_url)
    .bind(job.characters_synthesized.map(i64::from))
    .bind(job.error_kind.map(|k| k.to_string()))
    .bind(&job.error_message)
    .bind(&job.owner_worker_id)
    .bind(i64::from(job.attempts))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Duplicate(job.id));
    }
    Ok(())
}

/// Get a job by ID
pub async fn get_job<'e>(
    executor: impl PgExecutor<'e>,
    job_id: Uuid,
) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
    let row = sqlx::query(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// Lock a job row for the remainder of the transaction
pub async fn lock_job(conn: &mut PgConnection, job_id: Uuid) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// Write back every mutable column of a job
pub async fn save_job(conn: &mut PgConnection, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            narration_text = $3,
            narration_mode = $4,
            extraction_confidence = $5,
            tokens_used = $6,
            layout = $7,
            translated_text = $8,
            translation_status = $9,
            translation_error = $10,
            audio_ref = $11,
            audio_url = $12,
            characters_synthesized = $13,
            error_kind = $14,
            error_message = $15,
            owner_worker_id = $16,
            attempts = $17,
            updated_at = $18
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.status.to_string())
    .bind(&job.narration_text)
    .bind(job.narration_mode.map(|m| m.to_string()))
    .bind(job.extraction_confidence)
    .bind(job.tokens_used.map(i64::from))
    .bind(job.layout.map(Json))
    .bind(&job.translated_text)
    .bind(job.translation_status.map(|s| s.to_string()))
    .bind(&job.translation_error)
    .bind(&job.audio_ref)
    .bind(&job.audio_url)
    .bind(job.characters_synthesized.map(i64::from))
    .bind(job.error_kind.map(|k| k.to_string()))
    .bind(&job.error_message)
    .bind(&job.owner_worker_id)
    .bind(i64::from(job.attempts))
    .bind(job.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Check whether a job exists
pub async fn job_exists<'e>(executor: impl PgExecutor<'e>, job_id: Uuid) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1) AS present")
        .bind(job_id)
        .fetch_one(executor)
        .await?;

    Ok(row.try_get("present")?)
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt { id, reason };

    let options: Json<JobOptions> = row.try_get("options")?;
    let tokens_used: Option<i64> = row.try_get("tokens_used")?;
    let layout: Option<Json<PageLayout>> = row.try_get("layout")?;
    let characters: Option<i64> = row.try_get("characters_synthesized")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(Job {
        id,
        kind: parse_column(row, "kind")?.ok_or_else(|| corrupt("missing kind".to_string()))?,
        status: parse_column(row, "status")?.ok_or_else(|| corrupt("missing status".to_string()))?,
        input_ref: row.try_get("input_ref")?,
        options: options.0,
        narration_text: row.try_get("narration_text")?,
        narration_mode: parse_column(row, "narration_mode")?,
        extraction_confidence: row.try_get("extraction_confidence")?,
        tokens_used: tokens_used.and_then(|v| u32::try_from(v).ok()),
        layout: layout.map(|l| l.0),
        translated_text: row.try_get("translated_text")?,
        translation_status: parse_column(row, "translation_status")?,
        translation_error: row.try_get("translation_error")?,
        audio_ref: row.try_get("audio_ref")?,
        audio_url: row.try_get("audio_url")?,
        characters_synthesized: characters.and_then(|v| u32::try_from(v).ok()),
        error_kind: parse_column(row, "error_kind")?,
        error_message: row.try_get("error_message")?,
        owner_worker_id: row.try_get("owner_worker_id")?,
        attempts: u32::try_from(attempts).map_err(|e| corrupt(e.to_string()))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Read a nullable text column holding a strum-encoded enum.
fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> Result<Option<T>, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        T::from_str(&value).map_err(|_| StoreError::Corrupt {
            id,
            reason: format!("unknown {column} '{value}'"),
        })
    })
    .transpose()
}
