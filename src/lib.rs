//! dispatch-core
//!
//! Request-processing core that sits between an upstream entry point and a
//! downstream executor. Incoming requests are buffered into batches,
//! coalesced when identical, ordered by priority with per-client fairness
//! and executed with bounded concurrency.
//!
//! # Pipeline
//!
//! ```text
//! submit -> RequestBatcher -> BatchProcessor -> DeduplicationCache
//!                                            -> RequestScheduler
//!                                            -> Executor
//! ```
//!
//! Every caller receives exactly one response for its request id, either a
//! success or a response carrying a structured error. Only an explicit
//! shutdown leaves requests unanswered, and those are rejected with a
//! shutdown error.

pub mod api;
pub mod batch;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod request;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use api::{BatchPayload, BatchResult, StatusReport, DEFAULT_MAX_PAYLOAD_SIZE};
use batch::{BatchConfig, BatchProcessor, BatcherConfig, Executor, RequestBatcher, ResponseHandle};
use config::ConfigError;
use dedup::{DedupConfig, DeduplicationCache};
use error::CoreError;
use request::{generate_request_id, BatchedResponse, RequestSpec};
use scheduler::{RequestScheduler, SchedulerConfig};
use shutdown::DrainResult;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dedup: DedupConfig,
    pub scheduler: SchedulerConfig,
    pub batch: BatchConfig,
    pub batcher: BatcherConfig,
    /// Largest payload `process_payload` accepts.
    pub max_payload_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup: DedupConfig::default(),
            scheduler: SchedulerConfig::default(),
            batch: BatchConfig::default(),
            batcher: BatcherConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if self.batcher.max_batch_size == 0 {
            return invalid("max_batch_size", "must be at least 1");
        }
        if self.batcher.batch_timeout.is_zero() {
            return invalid("batch_timeout", "must be positive");
        }
        if self.batcher.max_wait_time < self.batcher.batch_timeout {
            return invalid("max_wait_time", "must not be shorter than batch_timeout");
        }
        if self.batch.max_concurrency == 0 {
            return invalid("max_concurrency", "must be at least 1");
        }
        if self.dedup.max_pending_time.is_zero() {
            return invalid("max_pending_time", "must be positive");
        }
        if self.scheduler.starvation_threshold.is_zero() {
            return invalid("starvation_threshold", "must be positive");
        }
        if self.scheduler.balancer.queue_count == 0 {
            return invalid("queue_count", "must be at least 1");
        }
        if self.scheduler.balancer.queue_capacity == 0 {
            return invalid("queue_capacity", "must be at least 1");
        }
        if self
            .scheduler
            .balancer
            .weights
            .iter()
            .any(|w| !(w.is_finite() && *w > 0.0))
        {
            return invalid("queue_weights", "weights must be positive");
        }
        if self.scheduler.fairness.max_concurrent_per_client == 0 {
            return invalid("max_concurrent_per_client", "must be at least 1");
        }
        if self.max_payload_size == 0 {
            return invalid("max_payload_size", "must be at least 1");
        }
        Ok(())
    }
}

/// The assembled pipeline: cache, scheduler, processor and batcher plus
/// their background tasks.
///
/// Batches go through the scheduler for fairness admission and ordering
/// only; they never enter its shared queues. Those queues, and the
/// starvation boosts the maintenance task applies to them, serve callers
/// that use [`RequestScheduler::schedule_request`] and
/// [`RequestScheduler::get_next_request`] directly through
/// [`Pipeline::scheduler`].
pub struct Pipeline {
    config: PipelineConfig,
    cache: DeduplicationCache,
    scheduler: Arc<RequestScheduler>,
    processor: Arc<BatchProcessor>,
    batcher: RequestBatcher,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build the pipeline around an executor and start its background
    /// tasks. Must be called inside a tokio runtime.
    pub fn new(config: PipelineConfig, executor: Arc<dyn Executor>) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = DeduplicationCache::new(config.dedup.clone());
        let scheduler = Arc::new(RequestScheduler::new(config.scheduler.clone()));
        let processor = Arc::new(
            BatchProcessor::new(config.batch.clone(), executor, cache.clone())
                .with_scheduler(Arc::clone(&scheduler)),
        );
        let batcher = RequestBatcher::new(config.batcher.clone(), Arc::clone(&processor));

        let background = CancellationToken::new();
        let tasks = vec![
            cache.spawn_sweeper(background.child_token()),
            scheduler.spawn_maintenance(background.child_token()),
        ];

        tracing::info!(
            max_batch_size = config.batcher.max_batch_size,
            batch_timeout_ms = config.batcher.batch_timeout.as_millis() as u64,
            deduplication = config.batch.enable_deduplication,
            prioritization = config.batch.enable_prioritization,
            fairness = config.scheduler.enable_fairness,
            "pipeline started"
        );

        Ok(Self {
            config,
            cache,
            scheduler,
            processor,
            batcher,
            background,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &DeduplicationCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    pub fn processor(&self) -> &Arc<BatchProcessor> {
        &self.processor
    }

    pub fn batcher(&self) -> &RequestBatcher {
        &self.batcher
    }

    /// Queue one request for batching.
    pub fn submit(&self, spec: RequestSpec) -> Result<ResponseHandle, CoreError> {
        self.batcher.submit(spec)
    }

    /// Submit one request and wait for its response.
    pub async fn add_request(&self, spec: RequestSpec) -> Result<BatchedResponse, CoreError> {
        self.batcher.add_request(spec).await
    }

    /// Process buffered requests now.
    pub async fn flush(&self) {
        self.batcher.flush().await;
    }

    /// Validate and process a whole payload directly, bypassing the
    /// debounce buffer. A malformed payload is rejected before any item
    /// starts.
    pub async fn process_payload(&self, payload: BatchPayload) -> Result<BatchResult, CoreError> {
        if self.batcher.is_shut_down() {
            return Err(CoreError::Shutdown);
        }
        if let Err(err) = payload.validate(self.config.max_payload_size) {
            tracing::warn!(error = %err, "batch payload rejected");
            return Err(err);
        }

        let started = Instant::now();
        let options = payload.options.unwrap_or_default();
        let mut batch_config = options.apply(self.processor.config());
        let chunk = options.chunk_size(payload.requests.len());

        let mut items = payload
            .requests
            .into_iter()
            .map(|spec| {
                let id = spec.id.clone().unwrap_or_else(generate_request_id);
                spec.into_work_item(id)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // The payload was admitted as a whole; later chunks skip client pacing.
        let mut responses = Vec::with_capacity(items.len());
        while !items.is_empty() {
            let rest = items.split_off(chunk.min(items.len()));
            responses.extend(self.processor.process_batch_with(items, &batch_config).await);
            batch_config.pace_clients = false;
            items = rest;
        }
        Ok(BatchResult::new(responses, started.elapsed()))
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            pending_responses: self.batcher.pending_responses(),
            batching_enabled: !self.batcher.is_shut_down(),
            deduplication_enabled: self.config.batch.enable_deduplication,
            prioritization_enabled: self.config.batch.enable_prioritization,
            queued_requests: self.scheduler.len(),
            cache_size: self.cache.len(),
        }
    }

    /// Flush, drain and reject what remains, then stop background tasks.
    pub async fn shutdown(&self) -> DrainResult {
        let result = self.batcher.shutdown().await;
        self.background.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        self.scheduler.log_statistics();
        tracing::info!(?result, "pipeline stopped");
        result
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.background.cancel();
    }
}
