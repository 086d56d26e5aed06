use garde::Validate;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::{ErrorKind, Job, JobKind, JobOptions};
use crate::models::status::JobStatusView;
use crate::pipeline::record_failure;
use crate::services::job_store::{JobStore, StoreError};
use crate::services::queue::{Broker, QueueError};
use crate::services::storage::{AssetError, AssetStore};

/// Which queue a job of given options should go to.
#[derive(Debug, Clone)]
pub struct QueueRouting {
    pub default_queue: String,
    /// Jobs that need translation do more external calls and go here.
    pub heavy_queue: String,
}

impl Default for QueueRouting {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            heavy_queue: "heavy".to_string(),
        }
    }
}

impl QueueRouting {
    pub fn queue_for(&self, options: &JobOptions) -> &str {
        if options.translate {
            &self.heavy_queue
        } else {
            &self.default_queue
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    #[error("Image upload is empty")]
    EmptyImage,

    #[error("Object storage error: {0}")]
    Assets(#[from] AssetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to enqueue job {job_id}: {source}")]
    Enqueue {
        job_id: Uuid,
        #[source]
        source: QueueError,
    },
}

/// Accepts new jobs and serves their status.
pub struct JobService {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    assets: Arc<AssetStore>,
    routing: QueueRouting,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        assets: Arc<AssetStore>,
        routing: QueueRouting,
    ) -> Self {
        Self {
            store,
            broker,
            assets,
            routing,
        }
    }

    /// Store the image, persist a `Queued` record, then enqueue.
    ///
    /// The record is always written before the message exists, so a worker
    /// never dequeues a job it cannot find. If the broker refuses the message
    /// the record is marked `Failed` with `EnqueueFailed`. If the record
    /// cannot be written, the uploaded image is removed again.
    pub async fn submit_job(&self, image: &[u8], options: JobOptions) -> Result<Uuid, ServiceError> {
        if image.is_empty() {
            return Err(ServiceError::EmptyImage);
        }
        options
            .validate()
            .map_err(|e| ServiceError::InvalidOptions(e.to_string()))?;

        let job_id = Uuid::new_v4();
        let input_ref = self.assets.put_image(job_id, image).await?;
        let job = Job::with_id(job_id, JobKind::ComicNarration, input_ref, options);
        if let Err(e) = self.store.create(&job).await {
            if let Err(cleanup) = self.assets.delete_image(job_id).await {
                tracing::error!(job_id = %job_id, error = %cleanup, "Failed to remove orphaned image");
            }
            return Err(e.into());
        }

        let queue = self.routing.queue_for(&job.options);
        match self.broker.enqueue(queue, job_id, job.kind).await {
            Ok(handle) => {
                metrics::counter!("jobs_submitted_total", "queue" => queue.to_string()).increment(1);
                tracing::info!(
                    job_id = %job_id,
                    queue = %handle.queue,
                    message_id = %handle.message_id,
                    translate = job.options.translate,
                    "Job submitted"
                );
                Ok(job_id)
            }
            Err(source) => {
                metrics::counter!("jobs_enqueue_failed_total").increment(1);
                if let Err(e) = record_failure(
                    self.store.as_ref(),
                    job_id,
                    ErrorKind::EnqueueFailed,
                    source.to_string(),
                )
                .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark unqueued job as failed");
                }
                Err(ServiceError::Enqueue { job_id, source })
            }
        }
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusView, ServiceError> {
        Ok(self.store.get(job_id).await?.into())
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use crate::services::encryption::EncryptionService;
    use crate::models::job::UpdateOutcome;
    use crate::services::job_store::{JobMutator, MemoryJobStore};
    use crate::services::queue::{Delivery, DeliveryToken, EnqueueHandle, MemoryBroker};
    use crate::services::storage::MemoryBlobStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct RefusingBroker;

    #[async_trait]
    impl Broker for RefusingBroker {
        async fn enqueue(&self, _: &str, _: Uuid, _: JobKind) -> Result<EnqueueHandle, QueueError> {
            Err(QueueError::NoQueues)
        }
        async fn try_dequeue(&self, _: &[String]) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: &DeliveryToken) -> Result<bool, QueueError> {
            Ok(false)
        }
        async fn depth(&self, _: &str) -> Result<u64, QueueError> {
            Ok(0)
        }
        async fn ping(&self) -> Result<(), QueueError> {
            Ok(())
        }
        fn poll_interval(&self) -> Duration {
            Duration::from_millis(5)
        }
    }

    /// Job store whose database is down.
    struct OfflineStore;

    #[async_trait]
    impl JobStore for OfflineStore {
        async fn create(&self, _: &Job) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
            Err(StoreError::NotFound(id))
        }
        async fn update(&self, id: Uuid, _: JobMutator<'_>) -> Result<UpdateOutcome, StoreError> {
            Err(StoreError::NotFound(id))
        }
        async fn exists(&self, _: Uuid) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn service(broker: Arc<dyn Broker>) -> (JobService, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let key = EncryptionService::generate_key();
        let assets = AssetStore::new(
            Arc::new(MemoryBlobStore::new()),
            EncryptionService::new(&key).unwrap(),
        );
        let service = JobService::new(
            store.clone(),
            broker,
            Arc::new(assets),
            QueueRouting::default(),
        );
        (service, store)
    }

    #[tokio::test]
    async fn test_submit_persists_then_enqueues() {
        let broker = Arc::new(MemoryBroker::new(Duration::from_secs(5), Duration::from_millis(5)));
        let (service, _store) = service(broker.clone());

        let job_id = service.submit_job(b"png", JobOptions::default()).await.unwrap();

        let view = service.get_status(job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(broker.depth("default").await.unwrap(), 1);
        assert_eq!(broker.depth("heavy").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_translation_jobs_are_routed_to_heavy_queue() {
        let broker = Arc::new(MemoryBroker::new(Duration::from_secs(5), Duration::from_millis(5)));
        let (service, _store) = service(broker.clone());
        let options = JobOptions {
            translate: true,
            ..JobOptions::default()
        };

        service.submit_job(b"png", options).await.unwrap();
        assert_eq!(broker.depth("heavy").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_failure_marks_job_failed() {
        let (service, store) = service(Arc::new(RefusingBroker));

        let err = service.submit_job(b"png", JobOptions::default()).await.unwrap_err();
        let ServiceError::Enqueue { job_id, .. } = err else {
            panic!("expected enqueue error, got {err:?}");
        };

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(ErrorKind::EnqueueFailed));
    }

    #[tokio::test]
    async fn test_failed_record_write_removes_uploaded_image() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let broker = Arc::new(MemoryBroker::new(Duration::from_secs(5), Duration::from_millis(5)));
        let assets = AssetStore::new(
            blobs.clone(),
            EncryptionService::new(&EncryptionService::generate_key()).unwrap(),
        );
        let service = JobService::new(
            Arc::new(OfflineStore),
            broker.clone(),
            Arc::new(assets),
            QueueRouting::default(),
        );

        let result = service.submit_job(b"png", JobOptions::default()).await;
        assert!(matches!(result, Err(ServiceError::Store(StoreError::Unavailable(_)))));
        assert!(blobs.keys_with_prefix("images/").is_empty());
        assert_eq!(broker.depth("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_any_write() {
        let broker = Arc::new(MemoryBroker::new(Duration::from_secs(5), Duration::from_millis(5)));
        let (service, store) = service(broker);

        assert!(matches!(
            service.submit_job(b"", JobOptions::default()).await,
            Err(ServiceError::EmptyImage)
        ));

        let options = JobOptions {
            voice: String::new(),
            ..JobOptions::default()
        };
        assert!(matches!(
            service.submit_job(b"png", options).await,
            Err(ServiceError::InvalidOptions(_))
        ));
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_status() {
        let broker = Arc::new(MemoryBroker::new(Duration::from_secs(5), Duration::from_millis(5)));
        let (service, _store) = service(broker);
        assert!(matches!(
            service.get_status(Uuid::new_v4()).await,
            Err(ServiceError::Store(StoreError::NotFound(_)))
        ));
    }
}
