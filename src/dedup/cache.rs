//! Response cache with in-flight request coalescing.
//!
//! The first caller for a fresh key gets an [`ExecutionTicket`] and runs the
//! operation. Callers that arrive while the ticket is outstanding become
//! waiters and are released together when it completes. Callers that arrive
//! after completion read the cache.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::key::DEFAULT_IGNORE_HEADERS;
use crate::error::{CoreError, ExecutionError};
use crate::request::BatchedResponse;
use crate::telemetry;

/// Rough per-entry footprint used for the memory estimate.
const ENTRY_SIZE_ESTIMATE: usize = 2048;
/// Rough per-waiter footprint used for the memory estimate.
const WAITER_SIZE_ESTIMATE: usize = 256;

/// Cached responses are shared, never copied, between waiters.
pub type SharedResponse = Arc<BatchedResponse>;

type WaiterResult = Result<SharedResponse, CoreError>;

/// Configuration for the deduplication cache.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub max_cache_size: usize,
    /// How long a waiter may wait for the originating execution.
    pub max_pending_time: Duration,
    /// Entries older than this expire regardless of use.
    pub max_age: Duration,
    pub sweep_interval: Duration,
    pub memory_warning_bytes: usize,
    pub ignore_headers: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 1000,
            max_pending_time: Duration::from_millis(5000),
            max_age: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            memory_warning_bytes: 50 * 1024 * 1024,
            ignore_headers: DEFAULT_IGNORE_HEADERS.iter().map(|h| h.to_string()).collect(),
        }
    }
}

struct CacheEntry {
    response: SharedResponse,
    created_at: Instant,
    access_count: u64,
    last_access: Instant,
    /// Monotonic access stamp; the smallest is least recently used.
    access_seq: u64,
}

struct Waiter {
    token: u64,
    id: String,
    arrived_at: Instant,
    client_id: Option<String>,
    tx: oneshot::Sender<WaiterResult>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, Vec<Waiter>>,
    in_flight: HashSet<String>,
    next_seq: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str, now: Instant) -> Option<SharedResponse> {
        self.next_seq += 1;
        let seq = self.next_seq;
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = now;
        entry.access_seq = seq;
        Some(entry.response.clone())
    }

    fn lru_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.access_seq)
            .map(|(k, _)| k.clone())
    }

    fn waiter_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

struct CacheInner {
    config: DedupConfig,
    state: Mutex<CacheState>,
    counters: Counters,
    next_waiter: AtomicU64,
}

impl CacheInner {
    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) <= self.config.max_age
    }

    fn release(&self, key: &str, result: WaiterResult) -> usize {
        let waiters = {
            let mut state = self.state.lock();
            state.in_flight.remove(key);
            state.pending.remove(key).unwrap_or_default()
        };
        let count = waiters.len();
        for waiter in waiters {
            tracing::trace!(key, waiter = %waiter.id, "releasing dedup waiter");
            let _ = waiter.tx.send(result.clone());
        }
        count
    }

    fn remove_waiter(&self, key: &str, token: u64) -> bool {
        let mut state = self.state.lock();
        let Some(waiters) = state.pending.get_mut(key) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|w| w.token != token);
        let removed = waiters.len() < before;
        if waiters.is_empty() {
            state.pending.remove(key);
        }
        removed
    }
}

/// Counters and sizes for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub timeouts: u64,
    pub evictions: u64,
    pub expired: u64,
    pub pending_keys: usize,
    pub pending_waiters: usize,
    pub in_flight: usize,
}

/// Outcome of one periodic sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_entries: usize,
    pub expired_waiters: usize,
    pub memory_estimate_bytes: usize,
}

/// Outcome of looking up a key.
#[derive(Debug)]
pub enum Lookup {
    /// A completed response exists.
    Cached(SharedResponse),
    /// Another caller is executing this key; wait for it.
    Pending(PendingResponse),
    /// Nobody owns this key; the caller must execute and complete the ticket.
    Execute(ExecutionTicket),
}

/// Short-TTL LRU response cache plus the table of in-flight waiters.
#[derive(Clone)]
pub struct DeduplicationCache {
    inner: Arc<CacheInner>,
}

impl DeduplicationCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState::default()),
                counters: Counters::default(),
                next_waiter: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.inner.config
    }

    /// Check for a fresh cached response without touching its LRU position.
    pub fn has_response(&self, key: &str) -> bool {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .is_some_and(|e| self.inner.is_fresh(e, now))
    }

    /// Read a cached response, refreshing its LRU position.
    pub fn get_response(&self, key: &str) -> Option<SharedResponse> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let fresh = state.entries.get(key).map(|e| self.inner.is_fresh(e, now));
        match fresh {
            Some(true) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                telemetry::record_cache_hit();
                state.touch(key, now)
            }
            Some(false) => {
                state.entries.remove(key);
                self.inner.counters.expired.fetch_add(1, Ordering::Relaxed);
                self.record_miss();
                None
            }
            None => {
                self.record_miss();
                None
            }
        }
    }

    /// Store a response and release every waiter on the key with it.
    ///
    /// Evicts the least recently used entry first when at capacity.
    /// Returns the number of waiters released.
    pub fn set_response(&self, key: &str, response: BatchedResponse) -> usize {
        let shared = self.insert(key, response);
        self.inner.release(key, Ok(shared))
    }

    fn insert(&self, key: &str, response: BatchedResponse) -> SharedResponse {
        let now = Instant::now();
        let shared = Arc::new(response);
        let mut state = self.inner.state.lock();
        let capacity = self.inner.config.max_cache_size;
        if capacity == 0 {
            return shared;
        }
        if !state.entries.contains_key(key) && state.entries.len() >= capacity {
            if let Some(lru) = state.lru_key() {
                state.entries.remove(&lru);
                self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                telemetry::record_cache_eviction();
                tracing::debug!(key = %lru, "evicted least recently used dedup entry");
            }
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                response: shared.clone(),
                created_at: now,
                access_count: 0,
                last_access: now,
                access_seq: seq,
            },
        );
        telemetry::record_cache_size(state.entries.len());
        shared
    }

    /// Release every waiter on the key with a response without caching it.
    pub fn release_uncached(&self, key: &str, response: BatchedResponse) -> usize {
        self.inner.release(key, Ok(Arc::new(response)))
    }

    /// Reject every waiter on the key with the same error.
    pub fn fail_pending(&self, key: &str, err: CoreError) -> usize {
        tracing::debug!(key, error = %err, "failing dedup waiters");
        self.inner.release(key, Err(err))
    }

    /// Register a waiter for the key. The waiter times out on its own after
    /// `max_pending_time` without affecting other waiters on the key.
    pub fn add_pending_request(
        &self,
        key: &str,
        waiter_id: &str,
        client_id: Option<&str>,
    ) -> PendingResponse {
        let mut state = self.inner.state.lock();
        self.register_waiter(&mut state, key, waiter_id, client_id)
    }

    fn register_waiter(
        &self,
        state: &mut CacheState,
        key: &str,
        waiter_id: &str,
        client_id: Option<&str>,
    ) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let arrived_at = Instant::now();
        state.pending.entry(key.to_string()).or_default().push(Waiter {
            token,
            id: waiter_id.to_string(),
            arrived_at,
            client_id: client_id.map(str::to_string),
            tx,
        });
        PendingResponse {
            key: key.to_string(),
            token,
            arrived_at,
            deadline: arrived_at + self.inner.config.max_pending_time,
            rx,
            inner: self.inner.clone(),
        }
    }

    /// Atomically resolve a key to a cached response, a wait on the in-flight
    /// execution, or ownership of a new execution.
    pub fn begin(&self, key: &str, request_id: &str, client_id: Option<&str>) -> Lookup {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let fresh = state.entries.get(key).map(|e| self.inner.is_fresh(e, now));
        match fresh {
            Some(true) => {
                if let Some(response) = state.touch(key, now) {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_cache_hit();
                    return Lookup::Cached(response);
                }
            }
            Some(false) => {
                state.entries.remove(key);
                self.inner.counters.expired.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }

        if state.in_flight.contains(key) {
            self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            telemetry::record_dedup_coalesced();
            let pending = self.register_waiter(&mut state, key, request_id, client_id);
            return Lookup::Pending(pending);
        }

        state.in_flight.insert(key.to_string());
        self.record_miss();
        Lookup::Execute(ExecutionTicket {
            key: key.to_string(),
            inner: self.inner.clone(),
            done: false,
        })
    }

    /// Expire old entries and overdue waiters, then check the memory estimate.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let max_pending = self.inner.config.max_pending_time;
        let mut overdue = Vec::new();

        let report = {
            let mut state = self.inner.state.lock();
            let before = state.entries.len();
            let max_age = self.inner.config.max_age;
            state
                .entries
                .retain(|_, e| now.saturating_duration_since(e.created_at) <= max_age);
            let expired_entries = before - state.entries.len();

            for (key, waiters) in state.pending.iter_mut() {
                let (late, on_time): (Vec<_>, Vec<_>) = waiters
                    .drain(..)
                    .partition(|w| now.saturating_duration_since(w.arrived_at) > max_pending);
                *waiters = on_time;
                overdue.extend(late.into_iter().map(|w| (key.clone(), w)));
            }
            state.pending.retain(|_, w| !w.is_empty());

            SweepReport {
                expired_entries,
                expired_waiters: overdue.len(),
                memory_estimate_bytes: state.entries.len() * ENTRY_SIZE_ESTIMATE
                    + state.waiter_count() * WAITER_SIZE_ESTIMATE,
            }
        };

        self.inner
            .counters
            .expired
            .fetch_add(report.expired_entries as u64, Ordering::Relaxed);
        for (key, waiter) in overdue {
            self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            telemetry::record_dedup_timeout();
            let waited_ms = now.saturating_duration_since(waiter.arrived_at).as_millis() as u64;
            tracing::warn!(
                key = %key,
                waiter = %waiter.id,
                client_id = waiter.client_id.as_deref().unwrap_or("-"),
                waited_ms,
                "dedup waiter expired during sweep"
            );
            let _ = waiter
                .tx
                .send(Err(CoreError::DeduplicationTimeout { key, waited_ms }));
        }

        if report.memory_estimate_bytes > self.inner.config.memory_warning_bytes {
            tracing::warn!(
                estimate_bytes = report.memory_estimate_bytes,
                threshold_bytes = self.inner.config.memory_warning_bytes,
                "dedup cache memory estimate above threshold"
            );
        }
        telemetry::record_cache_size(self.len());
        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = cache.sweep();
                        tracing::debug!(
                            expired_entries = report.expired_entries,
                            expired_waiters = report.expired_waiters,
                            memory_estimate_bytes = report.memory_estimate_bytes,
                            "dedup sweep"
                        );
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> DedupStats {
        let state = self.inner.state.lock();
        let c = &self.inner.counters;
        DedupStats {
            cache_size: state.entries.len(),
            cache_hits: c.hits.load(Ordering::Relaxed),
            cache_misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            pending_keys: state.pending.len(),
            pending_waiters: state.waiter_count(),
            in_flight: state.in_flight.len(),
        }
    }

    /// Access count of a cached entry, if present.
    pub fn access_count(&self, key: &str) -> Option<u64> {
        self.inner.state.lock().entries.get(key).map(|e| e.access_count)
    }

    /// Time of the last access to a cached entry, if present.
    pub fn last_access(&self, key: &str) -> Option<Instant> {
        self.inner.state.lock().entries.get(key).map(|e| e.last_access)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }

    /// Total number of registered waiters across all keys.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().waiter_count()
    }

    /// Drop all entries. Outstanding waiters and tickets are unaffected.
    pub fn clear(&self) {
        self.inner.state.lock().entries.clear();
        telemetry::record_cache_size(0);
    }

    fn record_miss(&self) {
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        telemetry::record_cache_miss();
    }
}

/// A registered waiter awaiting another caller's execution.
pub struct PendingResponse {
    key: String,
    token: u64,
    arrived_at: Instant,
    deadline: Instant,
    rx: oneshot::Receiver<WaiterResult>,
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl PendingResponse {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the originating execution or the waiter deadline.
    pub async fn wait(mut self) -> Result<SharedResponse, CoreError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.timeout_error()),
            Err(_) => {
                if self.inner.remove_waiter(&self.key, self.token) {
                    self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_dedup_timeout();
                    tracing::warn!(key = %self.key, "dedup waiter timed out");
                    return Err(self.timeout_error());
                }
                // Released between the deadline and the removal.
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(self.timeout_error()),
                }
            }
        }
    }

    fn timeout_error(&self) -> CoreError {
        CoreError::DeduplicationTimeout {
            key: self.key.clone(),
            waited_ms: self.arrived_at.elapsed().as_millis() as u64,
        }
    }
}

/// Ownership of the single execution for a key.
///
/// Dropping an unfinished ticket fails its waiters so none are stranded.
pub struct ExecutionTicket {
    key: String,
    inner: Arc<CacheInner>,
    done: bool,
}

impl std::fmt::Debug for ExecutionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTicket").field("key", &self.key).finish()
    }
}

impl ExecutionTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the response. Successful (< 400) responses are cached;
    /// all waiters receive it either way. Returns the waiters released.
    pub fn complete(mut self, response: BatchedResponse) -> usize {
        self.done = true;
        let cache = DeduplicationCache {
            inner: self.inner.clone(),
        };
        if response.is_success() && response.status < 400 {
            cache.set_response(&self.key, response)
        } else {
            cache.release_uncached(&self.key, response)
        }
    }

    /// Reject all waiters with the error. Nothing is cached.
    pub fn fail(mut self, err: CoreError) -> usize {
        self.done = true;
        self.inner.release(&self.key, Err(err))
    }
}

impl Drop for ExecutionTicket {
    fn drop(&mut self) {
        if !self.done {
            let err = CoreError::Execution(ExecutionError::new(
                "EXECUTION_ABANDONED",
                "originating execution was cancelled",
            ));
            self.inner.release(&self.key, Err(err));
        }
    }
}
