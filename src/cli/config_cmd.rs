// Copyright 2024-2026 dispatch-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults, validate.

use crate::config::{self, EffectiveConfig, EnvConfig, FileConfig};

/// Print effective config as key-value pairs to stdout.
pub fn run_show() {
    let cfg = config::load().effective_config();
    print_config(&cfg);
}

/// Print default config values (no env or file overrides) to stdout.
pub fn run_defaults() {
    print_config(&EnvConfig::default().effective_config());
}

/// Validate the configuration file and the layered result.
///
/// Returns 0 if valid, 1 if any problem is found.
pub fn run_validate() -> i32 {
    let env = config::load();
    let mut problems = 0;

    if let Some(path) = env.config_file.as_deref() {
        if let Err(e) = FileConfig::from_path(path) {
            eprintln!("ERROR: {e}");
            problems += 1;
        }
    }

    if let Err(e) = env.pipeline.validate() {
        eprintln!("ERROR: {e}");
        problems += 1;
    }

    let cfg = env.effective_config();
    if cfg.max_batch_size > cfg.max_payload_size {
        eprintln!(
            "WARNING: DISPATCH_MAX_BATCH_SIZE ({}) > DISPATCH_MAX_PAYLOAD_SIZE ({})",
            cfg.max_batch_size, cfg.max_payload_size
        );
    }

    if problems == 0 {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn render_config(cfg: &EffectiveConfig) -> Vec<String> {
    vec![
        format!("DISPATCH_MAX_BATCH_SIZE={}", cfg.max_batch_size),
        format!("DISPATCH_BATCH_TIMEOUT_MS={}", cfg.batch_timeout_ms),
        format!("DISPATCH_MAX_WAIT_TIME_MS={}", cfg.max_wait_time_ms),
        format!("DISPATCH_ENABLE_PRIORITIZATION={}", cfg.enable_prioritization),
        format!("DISPATCH_ENABLE_DEDUPLICATION={}", cfg.enable_deduplication),
        format!("DISPATCH_PARALLEL_EXECUTION={}", cfg.parallel_execution),
        format!("DISPATCH_MAX_CONCURRENCY={}", cfg.max_concurrency),
        format!("DISPATCH_ITEM_TIMEOUT_MS={}", cfg.item_timeout_ms),
        format!("DISPATCH_MAX_CACHE_SIZE={}", cfg.max_cache_size),
        format!("DISPATCH_MAX_PENDING_TIME_MS={}", cfg.max_pending_time_ms),
        format!("DISPATCH_CACHE_MAX_AGE_SECS={}", cfg.cache_max_age_secs),
        format!("DISPATCH_IGNORE_HEADERS={}", cfg.ignore_headers.join(",")),
        format!("DISPATCH_ENABLE_FAIRNESS={}", cfg.enable_fairness),
        format!("DISPATCH_STARVATION_THRESHOLD_MS={}", cfg.starvation_threshold_ms),
        format!("DISPATCH_QUEUE_COUNT={}", cfg.queue_count),
        format!("DISPATCH_QUEUE_CAPACITY={}", cfg.queue_capacity),
        format!("DISPATCH_MAX_CONCURRENT_PER_CLIENT={}", cfg.max_concurrent_per_client),
        format!("DISPATCH_MAX_PAYLOAD_SIZE={}", cfg.max_payload_size),
        format!("DISPATCH_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs),
        format!("DISPATCH_LOG_LEVEL={}", cfg.log_level),
        format!("DISPATCH_LOG_FORMAT={}", cfg.log_format),
    ]
}

fn print_config(cfg: &EffectiveConfig) {
    for line in render_config(cfg) {
        println!("{line}");
    }
}
