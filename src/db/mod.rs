use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{Job, UpdateOutcome};
use crate::services::job_store::{JobMutator, JobStore, StoreError};

pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Job store backed by the `jobs` table.
///
/// `update` locks the row with `SELECT ... FOR UPDATE` for the length of a
/// transaction, so two deliveries of the same job cannot interleave their
/// read-modify-write cycles.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        queries::insert_job(&self.pool, job).await
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        queries::get_job(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: Uuid, mutator: JobMutator<'_>) -> Result<UpdateOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut job = queries::lock_job(&mut tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let outcome = job.apply(mutator)?;
        if let UpdateOutcome::Applied(updated) = &outcome {
            queries::save_job(&mut tx, updated).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError> {
        queries::job_exists(&self.pool, id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
