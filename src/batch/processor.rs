//! Batch processing: dedup, ordering, bounded execution and fan-out of
//! responses back to every original request id.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::Instrument;

use super::executor::Executor;
use crate::dedup::{
    is_deduplicatable, DeduplicationCache, ExecutionTicket, KeyGenerator, Lookup, PendingResponse,
};
use crate::error::{CoreError, ExecutionError};
use crate::request::{BatchedResponse, WorkItem};
use crate::scheduler::RequestScheduler;
use crate::telemetry::{self, BatchSpan};

/// Configuration for batch processing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub enable_prioritization: bool,
    pub enable_deduplication: bool,
    /// Run unique items concurrently, bounded by `max_concurrency`.
    pub parallel_execution: bool,
    pub max_concurrency: usize,
    /// Per-item execution deadline.
    pub item_timeout: Option<Duration>,
    /// Apply the per-client minimum request interval at admission.
    pub pace_clients: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enable_prioritization: true,
            enable_deduplication: true,
            parallel_execution: true,
            max_concurrency: 5,
            item_timeout: None,
            pace_clients: true,
        }
    }
}

/// Running batch statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total_requests: u64,
    pub batches_processed: u64,
    pub average_batch_size: f64,
    pub average_processing_time_ms: f64,
    pub duplicates_detected: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub executions: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub rejections: u64,
}

/// Counts gathered while processing one batch.
#[derive(Debug, Default)]
struct BatchTally {
    duplicates: u64,
    cache_hits: u64,
    coalesced: u64,
    executions: u64,
    timeouts: u64,
    errors: u64,
    rejections: u64,
}

/// An item that will run, with the dedup ticket it owns if any.
struct Unique {
    index: usize,
    item: WorkItem,
    ticket: Option<ExecutionTicket>,
}

/// An item answered by another caller's execution.
struct Waiting {
    index: usize,
    id: String,
    pending: PendingResponse,
}

/// An in-batch duplicate answered from the slot of its first occurrence.
struct Duplicate {
    index: usize,
    id: String,
    source: usize,
}

/// Processes batches of work items against an executor.
pub struct BatchProcessor {
    config: BatchConfig,
    executor: Arc<dyn Executor>,
    cache: DeduplicationCache,
    keys: KeyGenerator,
    scheduler: Option<Arc<RequestScheduler>>,
    stats: Mutex<BatchStats>,
}

impl BatchProcessor {
    pub fn new(
        config: BatchConfig,
        executor: Arc<dyn Executor>,
        cache: DeduplicationCache,
    ) -> Self {
        let keys = KeyGenerator::new(cache.config().ignore_headers.iter());
        Self {
            config,
            executor,
            cache,
            keys,
            scheduler: None,
            stats: Mutex::new(BatchStats::default()),
        }
    }

    /// Route prioritized batches through the scheduler's fairness
    /// admission and ordering.
    pub fn with_scheduler(mut self, scheduler: Arc<RequestScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn cache(&self) -> &DeduplicationCache {
        &self.cache
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.lock().clone()
    }

    /// Process a batch with the configured settings.
    pub async fn process_batch(&self, items: Vec<WorkItem>) -> Vec<BatchedResponse> {
        let config = self.config.clone();
        self.process_batch_with(items, &config).await
    }

    /// Process a batch with per-call settings. Returns exactly one response
    /// per input item, in input order.
    pub async fn process_batch_with(
        &self,
        items: Vec<WorkItem>,
        config: &BatchConfig,
    ) -> Vec<BatchedResponse> {
        if items.is_empty() {
            return Vec::new();
        }
        let batch_id = format!("batch_{}", uuid::Uuid::new_v4().simple());
        let span = BatchSpan::new(&batch_id, items.len());
        self.run(&batch_id, items, config).instrument(span).await
    }

    async fn run(
        &self,
        batch_id: &str,
        items: Vec<WorkItem>,
        config: &BatchConfig,
    ) -> Vec<BatchedResponse> {
        let started = Instant::now();
        let size = items.len();
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let mut slots: Vec<Option<BatchedResponse>> = vec![None; size];
        let mut tally = BatchTally::default();

        let mut indexed: Vec<(usize, WorkItem)> = items.into_iter().enumerate().collect();
        if config.enable_prioritization {
            indexed.sort_by_key(|(_, item)| (item.priority, item.arrived_at));
        }

        let mut uniques = Vec::new();
        let mut waiting = Vec::new();
        let mut duplicates = Vec::new();
        let mut first_by_key: HashMap<String, usize> = HashMap::new();

        for (index, item) in indexed {
            if !(config.enable_deduplication && is_deduplicatable(item.method)) {
                uniques.push(Unique { index, item, ticket: None });
                continue;
            }
            let key = self
                .keys
                .generate_key(item.method, &item.url, &item.headers, item.body.as_ref());
            if let Some(&source) = first_by_key.get(&key) {
                tally.duplicates += 1;
                tracing::debug!(
                    batch_id,
                    request_id = %item.id,
                    key = %key,
                    "duplicate within batch"
                );
                duplicates.push(Duplicate { index, id: item.id, source });
                continue;
            }
            first_by_key.insert(key.clone(), index);

            match self.cache.begin(&key, &item.id, item.client_id.as_deref()) {
                Lookup::Cached(response) => {
                    tally.cache_hits += 1;
                    let mut response = response.for_request(&item.id);
                    response.cached = true;
                    slots[index] = Some(response);
                }
                Lookup::Pending(pending) => {
                    tally.coalesced += 1;
                    waiting.push(Waiting { index, id: item.id, pending });
                }
                Lookup::Execute(ticket) => uniques.push(Unique {
                    index,
                    item,
                    ticket: Some(ticket),
                }),
            }
        }

        let uniques = match (&self.scheduler, config.enable_prioritization) {
            (Some(scheduler), true) => {
                self.order_through(scheduler, uniques, config, &mut slots, &mut tally)
            }
            _ => uniques,
        };

        let executed = self.execute_all(uniques, config, &mut tally).await;
        for (index, response) in executed {
            slots[index] = Some(response);
        }

        let resolved = join_all(waiting.into_iter().map(|w| async move {
            let waited = Instant::now();
            let response = match w.pending.wait().await {
                Ok(shared) => {
                    let mut response = shared.for_request(&w.id);
                    response.deduplicated = true;
                    response
                }
                Err(err) => {
                    tracing::warn!(request_id = %w.id, error = %err, "coalesced request failed");
                    BatchedResponse::from_error(w.id.as_str(), &err, waited.elapsed())
                }
            };
            (w.index, response)
        }))
        .await;
        for (index, response) in resolved {
            if !response.is_success() {
                tally.errors += 1;
            }
            slots[index] = Some(response);
        }

        for dup in duplicates {
            let response = slots[dup.source].as_ref().map(|source| {
                let mut response = source.for_request(&dup.id);
                response.deduplicated = true;
                response
            });
            slots[dup.index] = response;
        }

        let responses: Vec<BatchedResponse> = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, id)| {
                slot.unwrap_or_else(|| {
                    tracing::error!(batch_id, request_id = %id, "no response produced for request");
                    let err = CoreError::Execution(ExecutionError::message("no response produced"));
                    BatchedResponse::from_error(id, &err, Duration::ZERO)
                })
            })
            .collect();

        let elapsed = started.elapsed();
        self.record(size, elapsed, &tally);
        tracing::Span::current().record("latency_ms", elapsed.as_millis() as u64);
        tracing::Span::current().record("executed", tally.executions);
        tracing::info!(
            batch_id,
            size,
            executed = tally.executions,
            duplicates = tally.duplicates,
            cache_hits = tally.cache_hits,
            coalesced = tally.coalesced,
            errors = tally.errors,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch processed"
        );
        responses
    }

    /// Reorder unique items through the scheduler. Items it rejects get an
    /// error response and fail their dedup waiters.
    fn order_through(
        &self,
        scheduler: &RequestScheduler,
        uniques: Vec<Unique>,
        config: &BatchConfig,
        slots: &mut [Option<BatchedResponse>],
        tally: &mut BatchTally,
    ) -> Vec<Unique> {
        let mut by_id: HashMap<String, VecDeque<(usize, Option<ExecutionTicket>)>> = HashMap::new();
        let mut items = Vec::with_capacity(uniques.len());
        for unique in uniques {
            by_id
                .entry(unique.item.id.clone())
                .or_default()
                .push_back((unique.index, unique.ticket));
            items.push(unique.item);
        }

        let order = scheduler.order_batch_with(items, config.pace_clients);
        for (item, err) in order.rejected {
            let Some((index, ticket)) = by_id.get_mut(&item.id).and_then(VecDeque::pop_front) else {
                continue;
            };
            tally.rejections += 1;
            if let Some(ticket) = ticket {
                ticket.fail(err.clone());
            }
            let response = BatchedResponse::from_error(item.id.as_str(), &err, item.wait_time());
            slots[index] = Some(response);
        }

        order
            .ordered
            .into_iter()
            .filter_map(|item| {
                let (index, ticket) = by_id.get_mut(&item.id).and_then(VecDeque::pop_front)?;
                Some(Unique { index, item, ticket })
            })
            .collect()
    }

    async fn execute_all(
        &self,
        uniques: Vec<Unique>,
        config: &BatchConfig,
        tally: &mut BatchTally,
    ) -> Vec<(usize, BatchedResponse)> {
        let results = if config.parallel_execution {
            let semaphore = Semaphore::new(config.max_concurrency.max(1));
            join_all(uniques.into_iter().map(|unique| {
                let semaphore = &semaphore;
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    self.execute_one(unique, config).await
                }
            }))
            .await
        } else {
            let mut results = Vec::with_capacity(uniques.len());
            for unique in uniques {
                results.push(self.execute_one(unique, config).await);
            }
            results
        };

        results
            .into_iter()
            .map(|(index, response, timed_out)| {
                tally.executions += 1;
                if timed_out {
                    tally.timeouts += 1;
                }
                if !response.is_success() {
                    tally.errors += 1;
                }
                (index, response)
            })
            .collect()
    }

    /// Run one item, converting errors, timeouts and panics into an error
    /// response. Returns the slot index, response and whether it timed out.
    async fn execute_one(
        &self,
        unique: Unique,
        config: &BatchConfig,
    ) -> (usize, BatchedResponse, bool) {
        let Unique { index, item, ticket } = unique;
        let started = Instant::now();

        let call = AssertUnwindSafe(self.executor.execute(&item)).catch_unwind();
        let outcome = match config.item_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(ExecutionError::timeout(limit.as_millis() as u64))),
            },
            None => call.await,
        };
        let result = outcome.unwrap_or_else(|panic| Err(panic_error(panic)));

        let elapsed = started.elapsed();
        let timed_out = matches!(&result, Err(e) if e.is_timeout());
        let response = match result {
            Ok(output) => BatchedResponse::from_output(item.id.as_str(), output, elapsed),
            Err(err) => {
                tracing::warn!(
                    request_id = %item.id,
                    key = ticket.as_ref().map(|t| t.key()).unwrap_or("-"),
                    code = %err.code,
                    error = %err.message,
                    "execution failed"
                );
                BatchedResponse::from_error(item.id.as_str(), &CoreError::Execution(err), elapsed)
            }
        };

        if let Some(scheduler) = &self.scheduler {
            if config.enable_prioritization {
                scheduler.complete_request(&item, response.is_success());
            }
        }
        if let Some(ticket) = ticket {
            ticket.complete(response.clone());
        }
        (index, response, timed_out)
    }

    fn record(&self, size: usize, elapsed: Duration, tally: &BatchTally) {
        telemetry::record_batch(size, elapsed);
        let mut stats = self.stats.lock();
        stats.total_requests += size as u64;
        stats.batches_processed += 1;
        let n = stats.batches_processed as f64;
        stats.average_batch_size += (size as f64 - stats.average_batch_size) / n;
        let ms = elapsed.as_secs_f64() * 1000.0;
        stats.average_processing_time_ms += (ms - stats.average_processing_time_ms) / n;
        stats.duplicates_detected += tally.duplicates;
        stats.cache_hits += tally.cache_hits;
        stats.coalesced += tally.coalesced;
        stats.executions += tally.executions;
        stats.timeouts += tally.timeouts;
        stats.errors += tally.errors;
        stats.rejections += tally.rejections;
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> ExecutionError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "executor panicked".to_string());
    ExecutionError::new(ExecutionError::PANIC, message)
}
