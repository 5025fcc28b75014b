//! Telemetry for the dispatch pipeline.
//!
//! Structured logging through `tracing`, batch spans, and counters, gauges
//! and histograms through the `metrics` facade. No exporter is installed
//! here; the embedding application chooses one.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    describe_metrics, record_batch, record_cache_eviction, record_cache_hit, record_cache_miss,
    record_cache_size, record_dedup_coalesced, record_dedup_timeout, record_execution,
    record_queue_depth, record_scheduling_rejection, record_starvation_boost,
    record_starvation_event,
};
pub use spans::{BatchSpan, SpanExt};
