//! Batching and execution.

mod batcher;
mod executor;
mod processor;

pub use batcher::{BatcherConfig, RequestBatcher, ResponseHandle};
pub use executor::{EchoExecutor, Executor, FnExecutor, Instrumented};
pub use processor::{BatchConfig, BatchProcessor, BatchStats};
