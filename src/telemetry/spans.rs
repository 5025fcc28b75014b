//! Span utilities and extension traits.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for batch spans.
pub struct BatchSpan;

impl BatchSpan {
    /// `executed` and `latency_ms` are filled in when the batch completes.
    pub fn new(batch_id: &str, size: usize) -> Span {
        info_span!(
            "process_batch",
            batch_id = %batch_id,
            size,
            executed = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
