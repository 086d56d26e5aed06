use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::job::{Job, TransitionError, UpdateOutcome};

/// Mutation applied to a job record inside `JobStore::update`.
pub type JobMutator<'a> = Box<dyn FnOnce(&mut Job) + Send + 'a>;

/// Shared, id-keyed job records. The single source of truth for status and results.
///
/// `update` is an atomic read-modify-write. It never touches a terminal
/// record, so a redelivered job cannot overwrite its final result.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    async fn update(&self, id: Uuid, mutator: JobMutator<'_>) -> Result<UpdateOutcome, StoreError>;

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Check backend connectivity (for health checks).
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

/// In-process job store for tests and single-node runs.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in no particular order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.lock().get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: Uuid, mutator: JobMutator<'_>) -> Result<UpdateOutcome, StoreError> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Ok(job.apply(mutator)?)
    }

    async fn exists(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(&id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
