//! Upstream boundary types.
//!
//! The JSON shapes an HTTP layer would accept and return. Nothing here does
//! I/O; the transport is the embedding application's concern.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::error::CoreError;
use crate::request::{BatchedResponse, RequestSpec};

/// Largest payload accepted when no limit is configured.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 100;

/// Per-payload overrides of the processor defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_deduplication: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_prioritization: Option<bool>,
    /// Split the payload into consecutive chunks of at most this many
    /// requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
    /// Per-item execution deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl BatchOptions {
    /// The processor settings with these overrides applied.
    pub fn apply(&self, base: &BatchConfig) -> BatchConfig {
        BatchConfig {
            enable_deduplication: self.enable_deduplication.unwrap_or(base.enable_deduplication),
            enable_prioritization: self.enable_prioritization.unwrap_or(base.enable_prioritization),
            item_timeout: self
                .timeout
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .or(base.item_timeout),
            ..base.clone()
        }
    }

    /// Chunk size for a payload of `len` requests.
    pub fn chunk_size(&self, len: usize) -> usize {
        self.max_batch_size.filter(|n| *n > 0).unwrap_or(len).max(1)
    }
}

/// A batch of requests as posted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub requests: Vec<RequestSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BatchOptions>,
}

impl BatchPayload {
    pub fn new(requests: Vec<RequestSpec>) -> Self {
        Self {
            requests,
            options: None,
        }
    }

    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Parse a payload from JSON.
    pub fn from_json(input: &str) -> Result<Self, CoreError> {
        serde_json::from_str(input)
            .map_err(|e| CoreError::Validation(format!("malformed batch payload: {e}")))
    }

    /// Reject the whole payload if any part of it is malformed.
    pub fn validate(&self, max_requests: usize) -> Result<(), CoreError> {
        if self.requests.is_empty() {
            return Err(CoreError::Validation("batch contains no requests".into()));
        }
        if self.requests.len() > max_requests {
            return Err(CoreError::Validation(format!(
                "batch of {} requests exceeds the limit of {max_requests}",
                self.requests.len()
            )));
        }

        let mut ids = HashSet::new();
        for (index, spec) in self.requests.iter().enumerate() {
            spec.validate()
                .map_err(|e| CoreError::Validation(format!("request {index}: {}", detail(&e))))?;
            if let Some(id) = spec.id.as_deref() {
                if !ids.insert(id) {
                    return Err(CoreError::Validation(format!("duplicate request id {id}")));
                }
            }
        }
        Ok(())
    }
}

fn detail(err: &CoreError) -> String {
    match err {
        CoreError::Validation(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Metadata returned with every processed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub total_requests: usize,
    pub processing_time_ms: u64,
    /// RFC 3339 completion time.
    pub timestamp: String,
}

/// Responses for a processed payload, in request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub responses: Vec<BatchedResponse>,
    pub metadata: BatchMetadata,
}

impl BatchResult {
    pub fn new(responses: Vec<BatchedResponse>, elapsed: Duration) -> Self {
        Self {
            metadata: BatchMetadata {
                total_requests: responses.len(),
                processing_time_ms: elapsed.as_millis() as u64,
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
            responses,
        }
    }
}

/// Status endpoint body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub pending_responses: usize,
    pub batching_enabled: bool,
    pub deduplication_enabled: bool,
    pub prioritization_enabled: bool,
    /// Items waiting in the scheduler's shared queues. Batches never sit
    /// there, so this counts only directly scheduled work.
    pub queued_requests: usize,
    pub cache_size: usize,
}
