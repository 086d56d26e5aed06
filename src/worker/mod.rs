//! Queue consumers.
//!
//! A worker leases one message at a time, dispatches it to the handler
//! registered for its job kind and acks only after the handler has persisted
//! a terminal state. Anything else leaves the lease to expire, so the broker
//! redelivers the job.

pub mod registry;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::job::ErrorKind;
use crate::pipeline::{record_failure, JobOutcome, PipelineError, RunContext};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::queue::{Broker, Delivery};

pub use registry::{HandlerRegistry, JobHandler, RegistryError};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Terminal state persisted, message acked.
    Acked(JobOutcome),
    /// Job record no longer exists; message acked and dropped.
    Dropped,
    /// Left un-acked for redelivery.
    Released,
}

pub struct Worker {
    id: String,
    broker: Arc<dyn Broker>,
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    queues: Vec<String>,
    max_deliveries: u32,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        queues: Vec<String>,
        max_deliveries: u32,
    ) -> Result<Self, RegistryError> {
        registry.validate()?;
        Ok(Self {
            id: id.into(),
            broker,
            store,
            registry,
            queues,
            max_deliveries,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consume until `shutdown` flips to `true`. The job in hand is always
    /// finished before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.id, queues = ?self.queues, "Worker started");

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.broker.dequeue(&self.queues) => result,
            };

            match delivery {
                Ok(delivery) => {
                    self.process(delivery).await;
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Dequeue failed, retrying");
                    tokio::time::sleep(self.broker.poll_interval()).await;
                }
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
    }

    /// Handle one leased message and decide whether to ack it.
    pub async fn process(&self, delivery: Delivery) -> Disposition {
        let job_id = delivery.job_id;
        tracing::info!(
            worker_id = %self.id,
            job_id = %job_id,
            kind = %delivery.kind,
            queue = %delivery.queue,
            attempt = delivery.attempt,
            "Processing job"
        );

        let result = if delivery.attempt > self.max_deliveries {
            metrics::counter!("worker_deliveries_exhausted_total").increment(1);
            record_failure(
                self.store.as_ref(),
                job_id,
                ErrorKind::DeliveryExhausted,
                format!(
                    "delivered {} times, limit is {}",
                    delivery.attempt, self.max_deliveries
                ),
            )
            .await
            .map(|outcome| JobOutcome::AlreadyTerminal(outcome.job().status))
            .map_err(PipelineError::from)
        } else {
            match self.registry.get(delivery.kind) {
                Ok(handler) => {
                    let ctx = RunContext {
                        worker_id: &self.id,
                        attempt: delivery.attempt,
                    };
                    handler.handle(job_id, ctx).await
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Cannot dispatch job");
                    return Disposition::Released;
                }
            }
        };

        let disposition = match result {
            Ok(outcome) => Disposition::Acked(outcome),
            Err(PipelineError::Store(StoreError::NotFound(_))) => {
                tracing::warn!(job_id = %job_id, "Job record missing, dropping message");
                Disposition::Dropped
            }
            Err(e) => {
                tracing::error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    attempt = delivery.attempt,
                    error = %e,
                    "Job interrupted, leaving message for redelivery"
                );
                metrics::counter!("worker_jobs_released_total").increment(1);
                return Disposition::Released;
            }
        };

        match self.broker.ack(&delivery.token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job_id, "Lease expired before ack, job may be redelivered");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Ack failed");
            }
        }
        disposition
    }
}

/// A set of workers sharing one shutdown signal.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: Vec<Worker>, shutdown: watch::Receiver<bool>) -> Self {
        let handles = workers
            .into_iter()
            .map(|worker| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}
