// Copyright 2024-2026 dispatch-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! `run` subcommand: process one batch payload through a local pipeline.
//!
//! The payload is the same JSON an upstream HTTP layer would post. Items are
//! answered by the echo executor, which makes the command useful for
//! checking dedup and ordering behaviour against a given configuration.

use std::sync::Arc;

use tokio::io::AsyncReadExt;

use super::CliError;
use crate::api::{BatchPayload, BatchResult};
use crate::batch::{EchoExecutor, Instrumented};
use crate::config;
use crate::{Pipeline, PipelineConfig};

/// Parse `input` and process it through a fresh pipeline.
pub async fn run_payload(input: &str, config: PipelineConfig) -> Result<BatchResult, CliError> {
    let payload = BatchPayload::from_json(input)?;
    let pipeline = Pipeline::new(config, Arc::new(Instrumented::new(EchoExecutor)))?;
    let result = pipeline.process_payload(payload).await;
    pipeline.shutdown().await;
    Ok(result?)
}

/// Read a payload from `path` (or stdin when `None` or `-`) and print the
/// result as JSON. Returns the process exit code.
pub async fn run_batch(path: Option<&str>) -> i32 {
    match run_batch_inner(path).await {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

async fn run_batch_inner(path: Option<&str>) -> Result<String, CliError> {
    let input = match path {
        Some(p) if p != "-" => tokio::fs::read_to_string(p).await?,
        _ => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    let env = config::load();
    let result = run_payload(&input, env.pipeline).await?;
    Ok(serde_json::to_string_pretty(&result)?)
}
