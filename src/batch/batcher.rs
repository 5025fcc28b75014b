//! Client-facing request batcher.
//!
//! Buffers single requests and hands them to the [`BatchProcessor`] once
//! the buffer is full or the debounce timer fires. Each caller holds a
//! [`ResponseHandle`] that resolves with the response for its own id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::processor::BatchProcessor;
use crate::error::{CoreError, ExecutionError};
use crate::request::{generate_request_id, BatchedResponse, RequestSpec, WorkItem};
use crate::shutdown::{DrainCoordinator, DrainResult};

type ResponseSender = oneshot::Sender<Result<BatchedResponse, CoreError>>;

/// Configuration for the batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Buffer size that triggers immediate processing.
    pub max_batch_size: usize,
    /// Debounce delay, restarted by every new request.
    pub batch_timeout: Duration,
    /// Upper bound on the debounce delay, measured from the first buffered
    /// request.
    pub max_wait_time: Duration,
    /// How long shutdown waits for in-flight batches.
    pub shutdown_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            batch_timeout: Duration::from_millis(50),
            max_wait_time: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Buffer {
    items: Vec<WorkItem>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl Buffer {
    fn deadline(&self, config: &BatcherConfig) -> Option<Instant> {
        let first = self.first_at?;
        let last = self.last_at.unwrap_or(first);
        Some((last + config.batch_timeout).min(first + config.max_wait_time))
    }

    fn take(&mut self) -> Vec<WorkItem> {
        self.first_at = None;
        self.last_at = None;
        std::mem::take(&mut self.items)
    }
}

struct BatcherInner {
    config: BatcherConfig,
    processor: Arc<BatchProcessor>,
    buffer: Mutex<Buffer>,
    pending: DashMap<String, ResponseSender>,
    wake: Notify,
    shutdown: CancellationToken,
    drain: DrainCoordinator,
}

impl BatcherInner {
    async fn process(&self, items: Vec<WorkItem>) {
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let responses = self.processor.process_batch(items).await;
        for response in responses {
            match self.pending.remove(&response.id) {
                Some((_, tx)) => {
                    let _ = tx.send(Ok(response));
                }
                None => {
                    tracing::warn!(request_id = %response.id, "response for unknown request id")
                }
            }
        }
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                tracing::error!(request_id = %id, "batch returned no response for request");
                let err = ExecutionError::message("no response produced");
                let _ = tx.send(Err(CoreError::Execution(err)));
            }
        }
    }

    fn take_buffer(&self) -> Vec<WorkItem> {
        self.buffer.lock().take()
    }

    /// Process in the background, tracked for drain.
    fn dispatch(self: &Arc<Self>, items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }
        let guard = self.drain.track();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            inner.process(items).await;
        });
    }
}

/// Resolves with the response for one submitted request.
#[derive(Debug)]
pub struct ResponseHandle {
    id: String,
    rx: oneshot::Receiver<Result<BatchedResponse, CoreError>>,
}

impl ResponseHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for ResponseHandle {
    type Output = Result<BatchedResponse, CoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender only disappears when the batcher is torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoreError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Accumulates requests into batches.
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl RequestBatcher {
    /// Create the batcher and start its flush task. Must be called inside a
    /// tokio runtime.
    pub fn new(config: BatcherConfig, processor: Arc<BatchProcessor>) -> Self {
        let inner = Arc::new(BatcherInner {
            config,
            processor,
            buffer: Mutex::new(Buffer::default()),
            pending: DashMap::new(),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            drain: DrainCoordinator::new(),
        });
        let flusher = tokio::spawn(flush_loop(Arc::clone(&inner)));
        Self {
            inner,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }

    /// Buffer a request. Validation failures and submissions after shutdown
    /// are returned immediately.
    pub fn submit(&self, spec: RequestSpec) -> Result<ResponseHandle, CoreError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::Shutdown);
        }
        let id = spec.id.clone().unwrap_or_else(generate_request_id);
        let item = spec.into_work_item(id.clone())?;

        let (tx, rx) = oneshot::channel();
        match self.inner.pending.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CoreError::Validation(format!("request id {id} is already pending")));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let full = {
            let mut buffer = self.inner.buffer.lock();
            let now = Instant::now();
            buffer.first_at.get_or_insert(now);
            buffer.last_at = Some(now);
            buffer.items.push(item);
            (buffer.items.len() >= self.inner.config.max_batch_size).then(|| buffer.take())
        };
        match full {
            Some(items) => {
                tracing::debug!(size = items.len(), "batch full, dispatching");
                self.inner.dispatch(items);
            }
            None => self.inner.wake.notify_one(),
        }
        Ok(ResponseHandle { id, rx })
    }

    /// Submit and wait for the response.
    pub async fn add_request(&self, spec: RequestSpec) -> Result<BatchedResponse, CoreError> {
        self.submit(spec)?.await
    }

    /// Process whatever is buffered now and wait for it to finish.
    pub async fn flush(&self) {
        let items = self.inner.take_buffer();
        if !items.is_empty() {
            tracing::debug!(size = items.len(), "manual flush");
            self.inner.process(items).await;
        }
    }

    /// Requests buffered or awaiting a response.
    pub fn pending_responses(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().items.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting, flush the buffer, wait for in-flight batches and
    /// reject anything still unresolved with a shutdown error.
    pub async fn shutdown(&self) -> DrainResult {
        if self.inner.shutdown.is_cancelled() {
            return DrainResult::Complete;
        }
        self.inner.shutdown.cancel();
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            if let Err(e) = flusher.await {
                tracing::warn!(error = %e, "batch flusher ended abnormally");
            }
        }

        self.flush().await;
        let result = self.inner.drain.drain(self.inner.config.shutdown_timeout).await;

        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Some((_, tx)) = self.inner.pending.remove(id) {
                let _ = tx.send(Err(CoreError::Shutdown));
            }
        }
        tracing::info!(rejected = ids.len(), ?result, "request batcher shut down");
        result
    }
}

impl Drop for RequestBatcher {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Debounce loop: waits for a wake-up, then flushes when the buffer's
/// deadline passes. Every submit moves the deadline, capped by
/// `max_wait_time`.
async fn flush_loop(inner: Arc<BatcherInner>) {
    loop {
        let deadline = inner.buffer.lock().deadline(&inner.config);
        match deadline {
            None => {
                tokio::select! {
                    biased;
                    () = inner.shutdown.cancelled() => break,
                    () = inner.wake.notified() => {}
                }
            }
            Some(at) => {
                tokio::select! {
                    biased;
                    () = inner.shutdown.cancelled() => break,
                    () = inner.wake.notified() => {}
                    () = tokio::time::sleep_until(at) => {
                        let items = inner.take_buffer();
                        if !items.is_empty() {
                            tracing::debug!(size = items.len(), "batch timeout, dispatching");
                            inner.dispatch(items);
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("batch flusher stopped");
}
