// Copyright 2024-2026 dispatch-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! `status` subcommand: report the state of a pipeline built from the
//! current configuration.

use std::sync::Arc;

use serde::Serialize;

use super::CliError;
use crate::api::StatusReport;
use crate::batch::EchoExecutor;
use crate::config::{self, EffectiveConfig, EnvConfig};
use crate::Pipeline;

/// Status plus the configuration it was produced under.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: StatusReport,
    pub config: EffectiveConfig,
}

impl SystemStatus {
    /// Build a pipeline from `env`, capture its status, and stop it.
    pub async fn collect(env: &EnvConfig) -> Result<Self, CliError> {
        let pipeline = Pipeline::new(env.pipeline.clone(), Arc::new(EchoExecutor))?;
        let status = pipeline.status();
        pipeline.shutdown().await;
        Ok(Self {
            version: env!("CARGO_PKG_VERSION"),
            status,
            config: env.effective_config(),
        })
    }

    fn render_text(&self) -> String {
        let s = &self.status;
        let on_off = |flag: bool| if flag { "enabled" } else { "disabled" };
        format!(
            "dispatch-core {}\n\
             \n\
             Batching:        {}\n\
             Deduplication:   {}\n\
             Prioritization:  {}\n\
             Pending:         {}\n\
             Queued:          {}\n\
             Cache entries:   {}\n\
             \n\
             Batch size:      {} (timeout {} ms, max wait {} ms)\n\
             Concurrency:     {}\n\
             Queues:          {} x {}",
            self.version,
            on_off(s.batching_enabled),
            on_off(s.deduplication_enabled),
            on_off(s.prioritization_enabled),
            s.pending_responses,
            s.queued_requests,
            s.cache_size,
            self.config.max_batch_size,
            self.config.batch_timeout_ms,
            self.config.max_wait_time_ms,
            self.config.max_concurrency,
            self.config.queue_count,
            self.config.queue_capacity,
        )
    }
}

/// Print the status. Returns the process exit code.
pub async fn run_status(json_output: bool) -> i32 {
    let env = config::load();
    let status = match SystemStatus::collect(&env).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            return e.exit_code();
        }
    };

    if json_output {
        match serde_json::to_string_pretty(&status) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error: {e}");
                return 1;
            }
        }
    } else {
        println!("{}", status.render_text());
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_pipeline_is_idle() {
        let status = SystemStatus::collect(&EnvConfig::default()).await.unwrap();
        assert_eq!(status.status.pending_responses, 0);
        assert_eq!(status.status.queued_requests, 0);
        assert_eq!(status.status.cache_size, 0);
        assert!(status.status.batching_enabled);
        assert!(status.status.deduplication_enabled);
    }

    #[tokio::test]
    async fn json_uses_camel_case_status() {
        let status = SystemStatus::collect(&EnvConfig::default()).await.unwrap();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"]["pendingResponses"], 0);
        assert_eq!(json["config"]["max_batch_size"], 25);
    }

    #[tokio::test]
    async fn text_lists_settings() {
        let status = SystemStatus::collect(&EnvConfig::default()).await.unwrap();
        let text = status.render_text();
        assert!(text.contains("Deduplication:   enabled"));
        assert!(text.contains("Batch size:      25"));
    }
}
