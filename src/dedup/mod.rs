//! Request deduplication.
//!
//! Coalesces concurrent identical idempotent requests into one execution
//! and caches the result for a short window.

mod cache;
mod key;

pub use cache::{
    DedupConfig, DedupStats, DeduplicationCache, ExecutionTicket, Lookup, PendingResponse,
    SharedResponse, SweepReport,
};
pub use key::{
    hash_body, is_deduplicatable, normalize_url, rolling_hash, KeyGenerator,
    DEFAULT_IGNORE_HEADERS, EMPTY_BODY_HASH, EMPTY_HEADERS_HASH,
};
