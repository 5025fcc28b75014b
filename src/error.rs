//! Error types for the dispatch core.
//!
//! Every failure a caller can observe is one of the [`CoreError`] variants.
//! Per-item failures are converted into [`ErrorInfo`] and travel inside a
//! `BatchedResponse`; only payload validation aborts a whole batch.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error carried on the wire inside a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Failure reported by an executor for a single work item.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ExecutionError {
    pub const TIMEOUT: &'static str = "TIMEOUT";
    pub const PANIC: &'static str = "EXECUTOR_PANIC";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Generic executor failure with the default code.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("EXECUTION_ERROR", message)
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(Self::TIMEOUT, format!("execution exceeded {after_ms}ms"))
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.code == Self::TIMEOUT
    }
}

impl From<ExecutionError> for ErrorInfo {
    fn from(err: ExecutionError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            details: err.details,
        }
    }
}

/// Why the scheduler refused a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Target queue was at capacity.
    QueueFull,
    /// Client exceeded its concurrency quota or request rate.
    FairnessDenied,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::FairnessDenied => "fairness_denied",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue is at capacity"),
            Self::FairnessDenied => write!(f, "client quota exceeded"),
        }
    }
}

/// Errors surfaced by the dispatch core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Deduplication wait timed out after {waited_ms}ms for key {key}")]
    DeduplicationTimeout { key: String, waited_ms: u64 },

    #[error("Scheduling rejected: {0}")]
    SchedulingRejected(RejectReason),

    #[error("Execution failed: {0}")]
    Execution(ExecutionError),

    #[error("Batcher is shutting down")]
    Shutdown,
}

impl CoreError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::DeduplicationTimeout { .. } => "DEDUPLICATION_TIMEOUT",
            Self::SchedulingRejected(_) => "SCHEDULING_REJECTED",
            Self::Execution(e) => &e.code,
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// Returns true if the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeduplicationTimeout { .. } | Self::SchedulingRejected(_)
        )
    }

    /// Returns true if this error should be logged as a warning.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::SchedulingRejected(_) | Self::DeduplicationTimeout { .. }
        )
    }

    /// HTTP-style status used when the error is rendered as a response.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::DeduplicationTimeout { .. } => 504,
            Self::SchedulingRejected(_) => 503,
            Self::Execution(e) if e.is_timeout() => 504,
            Self::Execution(_) => 500,
            Self::Shutdown => 503,
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Execution(e) => e.clone().into(),
            Self::DeduplicationTimeout { key, waited_ms } => {
                ErrorInfo::new(self.code(), self.to_string()).with_details(serde_json::json!({
                    "key": key,
                    "waitedMs": waited_ms,
                    "retryable": true,
                }))
            }
            Self::SchedulingRejected(reason) => ErrorInfo::new(self.code(), self.to_string())
                .with_details(serde_json::json!({
                    "reason": reason.as_str(),
                    "retryable": true,
                })),
            _ => ErrorInfo::new(self.code(), self.to_string()),
        }
    }
}

impl From<ExecutionError> for CoreError {
    fn from(err: ExecutionError) -> Self {
        Self::Execution(err)
    }
}
