//! Pipeline configuration loading.
//!
//! Values come from `DISPATCH_*` environment variables layered over an
//! optional TOML file named by `DISPATCH_CONFIG_FILE`, layered over the
//! built-in defaults. Invalid values fall back to the layer below without
//! crashing and are clamped to sane floors.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `DISPATCH_MAX_BATCH_SIZE` | 25 | Buffered requests that trigger a batch |
//! | `DISPATCH_BATCH_TIMEOUT_MS` | 50 | Debounce delay |
//! | `DISPATCH_MAX_WAIT_TIME_MS` | 500 | Cap on the debounce delay |
//! | `DISPATCH_ENABLE_PRIORITIZATION` | true | Order batches by priority |
//! | `DISPATCH_ENABLE_DEDUPLICATION` | true | Coalesce identical requests |
//! | `DISPATCH_PARALLEL_EXECUTION` | true | Bounded-parallel execution |
//! | `DISPATCH_MAX_CONCURRENCY` | 5 | In-flight executions per batch |
//! | `DISPATCH_ITEM_TIMEOUT_MS` | 0 | Per-item deadline (0 = none) |
//! | `DISPATCH_MAX_CACHE_SIZE` | 1000 | Cached responses |
//! | `DISPATCH_MAX_PENDING_TIME_MS` | 5000 | Dedup waiter timeout |
//! | `DISPATCH_CACHE_MAX_AGE_SECS` | 300 | Cached response lifetime |
//! | `DISPATCH_IGNORE_HEADERS` | (built-in list) | Comma-separated headers left out of dedup keys |
//! | `DISPATCH_ENABLE_FAIRNESS` | true | Per-client fairness |
//! | `DISPATCH_STARVATION_THRESHOLD_MS` | 5000 | Wait before a priority boost |
//! | `DISPATCH_QUEUE_COUNT` | 3 | Scheduler queues |
//! | `DISPATCH_QUEUE_CAPACITY` | 1000 | Items per queue |
//! | `DISPATCH_MAX_CONCURRENT_PER_CLIENT` | 10 | In-flight requests per client |
//! | `DISPATCH_MAX_PAYLOAD_SIZE` | 100 | Requests per payload |
//! | `DISPATCH_SHUTDOWN_TIMEOUT` | 30 | Drain timeout (secs) |
//! | `DISPATCH_LOG_LEVEL` | dispatch_core=info | Log filter |
//! | `DISPATCH_LOG_FORMAT` | json | `json` or `pretty` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::LogFormat;
use crate::PipelineConfig;

/// Environment variable naming the optional TOML file.
pub const CONFIG_FILE_ENV: &str = "DISPATCH_CONFIG_FILE";

/// Default log filter.
pub const DEFAULT_LOG_LEVEL: &str = "dispatch_core=info";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    FileRead { path: String, message: String },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_wait_time_ms: u64,
    pub enable_prioritization: bool,
    pub enable_deduplication: bool,
    pub parallel_execution: bool,
    pub max_concurrency: usize,
    pub item_timeout_ms: u64,
    pub max_cache_size: usize,
    pub max_pending_time_ms: u64,
    pub cache_max_age_secs: u64,
    pub ignore_headers: Vec<String>,
    pub enable_fairness: bool,
    pub starvation_threshold_ms: u64,
    pub queue_count: usize,
    pub queue_capacity: usize,
    pub max_concurrent_per_client: usize,
    pub max_payload_size: usize,
    pub shutdown_timeout_secs: u64,
    pub log_level: String,
    pub log_format: String,
}

/// Optional TOML overlay. Keys match the environment variables without the
/// `DISPATCH_` prefix, in lower case.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub max_batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub max_wait_time_ms: Option<u64>,
    pub enable_prioritization: Option<bool>,
    pub enable_deduplication: Option<bool>,
    pub parallel_execution: Option<bool>,
    pub max_concurrency: Option<usize>,
    pub item_timeout_ms: Option<u64>,
    pub max_cache_size: Option<usize>,
    pub max_pending_time_ms: Option<u64>,
    pub cache_max_age_secs: Option<u64>,
    pub ignore_headers: Option<Vec<String>>,
    pub enable_fairness: Option<bool>,
    pub starvation_threshold_ms: Option<u64>,
    pub queue_count: Option<usize>,
    pub queue_weights: Option<Vec<f64>>,
    pub queue_capacity: Option<usize>,
    pub max_concurrent_per_client: Option<usize>,
    pub max_payload_size: Option<usize>,
    pub shutdown_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl FileConfig {
    /// Read and parse a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn apply(self, cfg: &mut EnvConfig) {
        let p = &mut cfg.pipeline;
        if let Some(v) = self.max_batch_size {
            p.batcher.max_batch_size = v;
        }
        if let Some(v) = self.batch_timeout_ms {
            p.batcher.batch_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.max_wait_time_ms {
            p.batcher.max_wait_time = Duration::from_millis(v);
        }
        if let Some(v) = self.enable_prioritization {
            p.batch.enable_prioritization = v;
        }
        if let Some(v) = self.enable_deduplication {
            p.batch.enable_deduplication = v;
        }
        if let Some(v) = self.parallel_execution {
            p.batch.parallel_execution = v;
        }
        if let Some(v) = self.max_concurrency {
            p.batch.max_concurrency = v;
        }
        if let Some(v) = self.item_timeout_ms {
            p.batch.item_timeout = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = self.max_cache_size {
            p.dedup.max_cache_size = v;
        }
        if let Some(v) = self.max_pending_time_ms {
            p.dedup.max_pending_time = Duration::from_millis(v);
        }
        if let Some(v) = self.cache_max_age_secs {
            p.dedup.max_age = Duration::from_secs(v);
        }
        if let Some(v) = self.ignore_headers {
            p.dedup.ignore_headers = v;
        }
        if let Some(v) = self.enable_fairness {
            p.scheduler.enable_fairness = v;
        }
        if let Some(v) = self.starvation_threshold_ms {
            p.scheduler.starvation_threshold = Duration::from_millis(v);
        }
        if let Some(v) = self.queue_count {
            p.scheduler.balancer.queue_count = v;
        }
        if let Some(v) = self.queue_weights {
            p.scheduler.balancer.weights = v;
        }
        if let Some(v) = self.queue_capacity {
            p.scheduler.balancer.queue_capacity = v;
        }
        if let Some(v) = self.max_concurrent_per_client {
            p.scheduler.fairness.max_concurrent_per_client = v;
        }
        if let Some(v) = self.max_payload_size {
            p.max_payload_size = v;
        }
        if let Some(v) = self.shutdown_timeout_secs {
            p.batcher.shutdown_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.log_level {
            cfg.log_level = v;
        }
        if let Some(v) = self.log_format.as_deref().and_then(parse_log_format) {
            cfg.log_format = v;
        }
    }
}

/// All configuration, after every layer is applied.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub config_file: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            pipeline: PipelineConfig::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: LogFormat::Json,
        }
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`true/false`, `1/0`, `yes/no`, `on/off`).
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_u64(key, default.as_millis() as u64))
}

fn parse_log_format(value: &str) -> Option<LogFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn apply_batching_env(p: &mut PipelineConfig) {
    let b = &mut p.batcher;
    b.max_batch_size = parse_usize("DISPATCH_MAX_BATCH_SIZE", b.max_batch_size).max(1);
    b.batch_timeout =
        parse_millis("DISPATCH_BATCH_TIMEOUT_MS", b.batch_timeout).max(Duration::from_millis(1));
    b.max_wait_time =
        parse_millis("DISPATCH_MAX_WAIT_TIME_MS", b.max_wait_time).max(b.batch_timeout);
    b.shutdown_timeout = Duration::from_secs(
        parse_u64("DISPATCH_SHUTDOWN_TIMEOUT", b.shutdown_timeout.as_secs()).max(1),
    );
    p.max_payload_size = parse_usize("DISPATCH_MAX_PAYLOAD_SIZE", p.max_payload_size).max(1);
}

fn apply_execution_env(p: &mut PipelineConfig) {
    let b = &mut p.batch;
    b.enable_prioritization = parse_bool("DISPATCH_ENABLE_PRIORITIZATION", b.enable_prioritization);
    b.enable_deduplication = parse_bool("DISPATCH_ENABLE_DEDUPLICATION", b.enable_deduplication);
    b.parallel_execution = parse_bool("DISPATCH_PARALLEL_EXECUTION", b.parallel_execution);
    b.max_concurrency = parse_usize("DISPATCH_MAX_CONCURRENCY", b.max_concurrency).clamp(1, 1024);
    let current = b.item_timeout.map_or(0, |t| t.as_millis() as u64);
    let timeout_ms = parse_u64("DISPATCH_ITEM_TIMEOUT_MS", current);
    b.item_timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
}

fn apply_dedup_env(p: &mut PipelineConfig) {
    let d = &mut p.dedup;
    d.max_cache_size = parse_usize("DISPATCH_MAX_CACHE_SIZE", d.max_cache_size);
    d.max_pending_time = parse_millis("DISPATCH_MAX_PENDING_TIME_MS", d.max_pending_time)
        .max(Duration::from_millis(1));
    let max_age_secs = parse_u64("DISPATCH_CACHE_MAX_AGE_SECS", d.max_age.as_secs()).max(1);
    d.max_age = Duration::from_secs(max_age_secs);
    if let Ok(list) = std::env::var("DISPATCH_IGNORE_HEADERS") {
        d.ignore_headers = list
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
    }
}

fn apply_scheduler_env(p: &mut PipelineConfig) {
    let s = &mut p.scheduler;
    s.enable_fairness = parse_bool("DISPATCH_ENABLE_FAIRNESS", s.enable_fairness);
    let threshold = parse_millis("DISPATCH_STARVATION_THRESHOLD_MS", s.starvation_threshold);
    s.starvation_threshold = threshold.max(Duration::from_millis(100));
    s.balancer.queue_count =
        parse_usize("DISPATCH_QUEUE_COUNT", s.balancer.queue_count).clamp(1, 64);
    s.balancer.queue_capacity =
        parse_usize("DISPATCH_QUEUE_CAPACITY", s.balancer.queue_capacity).max(1);
    let per_client = s.fairness.max_concurrent_per_client;
    s.fairness.max_concurrent_per_client =
        parse_usize("DISPATCH_MAX_CONCURRENT_PER_CLIENT", per_client).max(1);
}

/// Load all configuration.
///
/// An unreadable or malformed config file is logged and skipped; missing or
/// invalid environment values fall back to the layer below.
pub fn load() -> EnvConfig {
    let mut cfg = EnvConfig::default();

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        let path = PathBuf::from(path);
        match FileConfig::from_path(&path) {
            Ok(file) => file.apply(&mut cfg),
            Err(e) => tracing::warn!(error = %e, "ignoring config file"),
        }
        cfg.config_file = Some(path);
    }

    let p = &mut cfg.pipeline;
    apply_batching_env(p);
    apply_execution_env(p);
    apply_dedup_env(p);
    apply_scheduler_env(p);
    // Weights must match the queue count.
    let queues = p.scheduler.balancer.queue_count;
    if !p.scheduler.balancer.weights.is_empty() && p.scheduler.balancer.weights.len() != queues {
        tracing::warn!(
            queues,
            weights = p.scheduler.balancer.weights.len(),
            "queue weights ignored"
        );
        p.scheduler.balancer.weights.clear();
    }

    if let Ok(level) = std::env::var("DISPATCH_LOG_LEVEL") {
        if !level.trim().is_empty() {
            cfg.log_level = level;
        }
    }
    if let Some(format) = std::env::var("DISPATCH_LOG_FORMAT")
        .ok()
        .as_deref()
        .and_then(parse_log_format)
    {
        cfg.log_format = format;
    }
    cfg
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        let p = &self.pipeline;
        EffectiveConfig {
            max_batch_size: p.batcher.max_batch_size,
            batch_timeout_ms: p.batcher.batch_timeout.as_millis() as u64,
            max_wait_time_ms: p.batcher.max_wait_time.as_millis() as u64,
            enable_prioritization: p.batch.enable_prioritization,
            enable_deduplication: p.batch.enable_deduplication,
            parallel_execution: p.batch.parallel_execution,
            max_concurrency: p.batch.max_concurrency,
            item_timeout_ms: p.batch.item_timeout.map_or(0, |t| t.as_millis() as u64),
            max_cache_size: p.dedup.max_cache_size,
            max_pending_time_ms: p.dedup.max_pending_time.as_millis() as u64,
            cache_max_age_secs: p.dedup.max_age.as_secs(),
            ignore_headers: p.dedup.ignore_headers.clone(),
            enable_fairness: p.scheduler.enable_fairness,
            starvation_threshold_ms: p.scheduler.starvation_threshold.as_millis() as u64,
            queue_count: p.scheduler.balancer.queue_count,
            queue_capacity: p.scheduler.balancer.queue_capacity,
            max_concurrent_per_client: p.scheduler.fairness.max_concurrent_per_client,
            max_payload_size: p.max_payload_size,
            shutdown_timeout_secs: p.batcher.shutdown_timeout.as_secs(),
            log_level: self.log_level.clone(),
            log_format: match self.log_format {
                LogFormat::Json => "json".to_string(),
                LogFormat::Pretty => "pretty".to_string(),
            },
        }
    }
}
