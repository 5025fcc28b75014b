//! Metric names and recording helpers over the `metrics` facade.

use std::time::Duration;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};

use crate::error::RejectReason;

const CACHE_HITS: &str = "dispatch_cache_hits_total";
const CACHE_MISSES: &str = "dispatch_cache_misses_total";
const CACHE_EVICTIONS: &str = "dispatch_cache_evictions_total";
const CACHE_SIZE: &str = "dispatch_cache_size";
const DEDUP_COALESCED: &str = "dispatch_dedup_coalesced_total";
const DEDUP_TIMEOUTS: &str = "dispatch_dedup_timeouts_total";
const BATCHES: &str = "dispatch_batches_total";
const BATCH_SIZE: &str = "dispatch_batch_size";
const BATCH_DURATION: &str = "dispatch_batch_duration_seconds";
const EXECUTIONS: &str = "dispatch_executions_total";
const EXECUTION_FAILURES: &str = "dispatch_execution_failures_total";
const EXECUTION_DURATION: &str = "dispatch_execution_duration_seconds";
const REJECTIONS: &str = "dispatch_scheduling_rejections_total";
const STARVATION_BOOSTS: &str = "dispatch_starvation_boosts_total";
const STARVATION_EVENTS: &str = "dispatch_starvation_events_total";
const QUEUE_DEPTH: &str = "dispatch_queue_depth";

/// Register descriptions with whatever recorder is installed.
pub fn describe_metrics() {
    describe_counter!(CACHE_HITS, "Dedup cache hits");
    describe_counter!(CACHE_MISSES, "Dedup cache misses");
    describe_counter!(CACHE_EVICTIONS, "LRU evictions from the dedup cache");
    describe_gauge!(CACHE_SIZE, "Entries in the dedup cache");
    describe_counter!(DEDUP_COALESCED, "Requests coalesced onto an in-flight execution");
    describe_counter!(DEDUP_TIMEOUTS, "Dedup waiters that timed out");
    describe_counter!(BATCHES, "Batches processed");
    describe_histogram!(BATCH_SIZE, Unit::Count, "Requests per batch");
    describe_histogram!(BATCH_DURATION, Unit::Seconds, "Batch processing time");
    describe_counter!(EXECUTIONS, "Executor calls");
    describe_counter!(EXECUTION_FAILURES, "Executor calls that failed");
    describe_histogram!(EXECUTION_DURATION, Unit::Seconds, "Executor call duration");
    describe_counter!(REJECTIONS, "Scheduling rejections by reason");
    describe_counter!(STARVATION_BOOSTS, "Starvation priority boosts");
    describe_counter!(STARVATION_EVENTS, "Requests dequeued after the starvation threshold");
    describe_gauge!(QUEUE_DEPTH, "Items waiting per scheduler queue");
}

pub fn record_cache_hit() {
    counter!(CACHE_HITS).increment(1);
}

pub fn record_cache_miss() {
    counter!(CACHE_MISSES).increment(1);
}

pub fn record_cache_eviction() {
    counter!(CACHE_EVICTIONS).increment(1);
}

pub fn record_cache_size(entries: usize) {
    gauge!(CACHE_SIZE).set(entries as f64);
}

pub fn record_dedup_coalesced() {
    counter!(DEDUP_COALESCED).increment(1);
}

pub fn record_dedup_timeout() {
    counter!(DEDUP_TIMEOUTS).increment(1);
}

/// A batch finished.
pub fn record_batch(size: usize, elapsed: Duration) {
    counter!(BATCHES).increment(1);
    histogram!(BATCH_SIZE).record(size as f64);
    histogram!(BATCH_DURATION).record(elapsed.as_secs_f64());
}

/// One executor call finished.
pub fn record_execution(elapsed: Duration, success: bool) {
    counter!(EXECUTIONS).increment(1);
    if !success {
        counter!(EXECUTION_FAILURES).increment(1);
    }
    histogram!(EXECUTION_DURATION).record(elapsed.as_secs_f64());
}

pub fn record_scheduling_rejection(reason: RejectReason) {
    counter!(REJECTIONS, "reason" => reason.as_str()).increment(1);
}

pub fn record_starvation_boost() {
    counter!(STARVATION_BOOSTS).increment(1);
}

pub fn record_starvation_event() {
    counter!(STARVATION_EVENTS).increment(1);
}

pub fn record_queue_depth(queue: usize, depth: usize) {
    gauge!(QUEUE_DEPTH, "queue" => queue.to_string()).set(depth as f64);
}
