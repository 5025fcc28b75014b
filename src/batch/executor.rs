//! Downstream executor seam.
//!
//! The pipeline never inspects what an item does; it hands each unique
//! item to an [`Executor`] and turns the outcome into a response.
//! Instrumentation is explicit middleware composed around an executor.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::Instrument;

use crate::error::ExecutionError;
use crate::request::{ExecutionOutput, WorkItem};
use crate::telemetry::{self, SpanExt};

/// Executes one work item.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutput, ExecutionError>;
}

#[async_trait::async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutput, ExecutionError> {
        (**self).execute(item).await
    }
}

/// Adapts an async closure into an [`Executor`]. The closure receives an
/// owned copy of the item.
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ExecutionOutput, ExecutionError>> + Send,
{
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutput, ExecutionError> {
        (self.f)(item.clone()).await
    }
}

/// Middleware that wraps each execution in a span and records duration
/// and failure metrics.
pub struct Instrumented<E> {
    inner: E,
}

impl<E: Executor> Instrumented<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> E {
        self.inner
    }
}

#[async_trait::async_trait]
impl<E: Executor> Executor for Instrumented<E> {
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutput, ExecutionError> {
        let span = tracing::debug_span!(
            "execute",
            request_id = %item.id,
            method = %item.method,
            url = %item.url,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        );
        let started = Instant::now();
        let result = self.inner.execute(item).instrument(span.clone()).await;
        span.record_result(&result);
        let elapsed = started.elapsed();
        match &result {
            Ok(output) => telemetry::record_execution(elapsed, output.status < 400),
            Err(err) => {
                telemetry::record_execution(elapsed, false);
                tracing::debug!(request_id = %item.id, code = %err.code, "execution failed");
            }
        }
        result
    }
}

/// Answers every item with its own method, url and body. Used by the CLI
/// and benches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait::async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutput, ExecutionError> {
        Ok(ExecutionOutput::ok(serde_json::json!({
            "method": item.method.as_str(),
            "url": item.url,
            "body": item.body,
        })))
    }
}
