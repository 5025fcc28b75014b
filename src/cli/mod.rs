// Copyright 2024-2026 dispatch-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the dispatch pipeline.
//!
//! ## Usage
//!
//! ```bash
//! dispatch-core-cli run payload.json   # Process a batch payload file
//! dispatch-core-cli run < payload.json # ... or read it from stdin
//! dispatch-core-cli status --json      # Show pipeline status
//! dispatch-core-cli config show        # Show effective configuration
//! ```

pub mod config_cmd;
pub mod run_cmd;
pub mod status;

pub use run_cmd::{run_batch, run_payload};
pub use status::{run_status, SystemStatus};

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::CoreError;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// CLI command errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to read input: {0}")]
    Input(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Request rejected: {0}")]
    Request(#[from] CoreError),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => EXIT_CONFIG_ERROR,
            _ => 1,
        }
    }
}
