use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::models::job::JobKind;
use crate::pipeline::{JobOutcome, PipelineError, RunContext};

/// Runs one kind of job to completion.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job_id: Uuid, ctx: RunContext<'_>) -> Result<JobOutcome, PipelineError>;
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("No handler registered for job kind {0}")]
    MissingHandler(JobKind),
}

/// Kind → handler table, built once at worker startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Every job kind must have a handler before a worker may start.
    pub fn validate(&self) -> Result<(), RegistryError> {
        match JobKind::iter().find(|kind| !self.handlers.contains_key(kind)) {
            Some(kind) => Err(RegistryError::MissingHandler(kind)),
            None => Ok(()),
        }
    }

    pub fn get(&self, kind: JobKind) -> Result<&Arc<dyn JobHandler>, RegistryError> {
        self.handlers
            .get(&kind)
            .ok_or(RegistryError::MissingHandler(kind))
    }
}
