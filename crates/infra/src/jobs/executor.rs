//! Handler registry: routes a job to the handler registered for its type.
//!
//! Handlers are registered at startup. Once [`Executor::finish_registration`]
//! has been called the registry is frozen and further registrations fail.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use jobforge_core::JobUid;

use super::progress::ProgressReporter;

/// Failure returned by a handler; becomes the job's failure message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("handler already registered for job type {0:?}")]
    AlreadyRegistered(String),

    #[error("handler registration is closed (job type {0:?})")]
    RegistrationClosed(String),

    #[error("handler registry poisoned")]
    Poisoned,
}

/// Execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub uid: JobUid,
    pub job_type: String,
    /// Absolute time by which the execution must finish.
    pub deadline: DateTime<Utc>,
    /// Cancelled when the job is cancelled or its deadline passes.
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

/// A job handler.
///
/// Returns the serialized result on success. Handlers must be idempotent:
/// delivery is at-least-once.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: JobContext, data: String) -> Result<String, HandlerError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, HandlerError>> + Send,
{
    async fn handle(&self, ctx: JobContext, data: String) -> Result<String, HandlerError> {
        (self.0)(ctx, data).await
    }
}

/// Registry of job handlers keyed by job type.
#[derive(Default)]
pub struct Executor {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    finished: AtomicBool,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&self, job_type: impl Into<String>, handler: H) -> Result<(), ExecutorError>
    where
        H: Handler + 'static,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), ExecutorError> {
        let job_type = job_type.into();
        if self.finished.load(Ordering::Acquire) {
            return Err(ExecutorError::RegistrationClosed(job_type));
        }

        let mut handlers = self.handlers.write().map_err(|_| ExecutorError::Poisoned)?;
        if handlers.contains_key(&job_type) {
            return Err(ExecutorError::AlreadyRegistered(job_type));
        }

        tracing::debug!(job_type = %job_type, "registered job handler");
        handlers.insert(job_type, handler);
        Ok(())
    }

    /// Freeze the registry.
    pub fn finish_registration(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(job_type))
            .unwrap_or(false)
    }

    /// Run the handler for `ctx.job_type`.
    pub async fn exec(&self, ctx: JobContext, data: String) -> Result<String, HandlerError> {
        let handler = self
            .handlers
            .read()
            .map_err(|_| HandlerError::new("handler registry poisoned"))?
            .get(&ctx.job_type)
            .cloned();

        match handler {
            Some(handler) => handler.handle(ctx, data).await,
            None => Err(HandlerError::new("unknown job type")),
        }
    }
}

impl core::fmt::Debug for Executor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let types: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("Executor")
            .field("job_types", &types)
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish()
    }
}
