//! Per-client quotas and fairness-driven priority adjustment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::request::{PRIORITY_HIGHEST, PRIORITY_LOWEST};

/// Configuration for fairness enforcement.
#[derive(Debug, Clone)]
pub struct FairnessConfig {
    pub max_concurrent_per_client: usize,
    /// Floor for the dynamic minimum interval between a client's requests.
    pub min_request_interval: Duration,
    /// Fraction of the average processing time used as the minimum interval.
    pub interval_factor: f64,
    /// Relative deviation from an equal share that triggers an adjustment.
    pub share_tolerance: f64,
    /// Quotas untouched for this long with nothing in flight are purged.
    pub idle_timeout: Duration,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_client: 10,
            min_request_interval: Duration::from_millis(10),
            interval_factor: 0.1,
            share_tolerance: 0.2,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Bookkeeping for one client.
#[derive(Debug, Clone)]
pub struct ClientQuota {
    pub max_concurrent_requests: usize,
    pub current_requests: usize,
    pub total_requests: u64,
    pub total_wait_time: Duration,
    pub last_request_at: Instant,
}

impl ClientQuota {
    fn new(max_concurrent_requests: usize, now: Instant) -> Self {
        Self {
            max_concurrent_requests,
            current_requests: 0,
            total_requests: 0,
            total_wait_time: Duration::ZERO,
            last_request_at: now,
        }
    }

    /// Mean wait per completed request.
    pub fn average_wait_time(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        self.total_wait_time / self.total_requests as u32
    }
}

/// Keeps per-client throughput near an equal share.
pub struct FairnessManager {
    config: FairnessConfig,
    quotas: DashMap<String, ClientQuota>,
    total_processed: AtomicU64,
    /// f64 bits of the running average processing time in milliseconds.
    avg_processing_ms: AtomicU64,
}

impl FairnessManager {
    pub fn new(config: FairnessConfig) -> Self {
        Self {
            config,
            quotas: DashMap::new(),
            total_processed: AtomicU64::new(0),
            avg_processing_ms: AtomicU64::new(f64::to_bits(0.0)),
        }
    }

    /// Current minimum interval: `max(avg_processing * factor, floor)`.
    pub fn min_request_interval(&self) -> Duration {
        let avg_ms = f64::from_bits(self.avg_processing_ms.load(Ordering::Relaxed));
        let dynamic =
            Duration::from_secs_f64((avg_ms * self.config.interval_factor).max(0.0) / 1000.0);
        dynamic.max(self.config.min_request_interval)
    }

    /// False if the client is at its concurrency limit or is requesting
    /// faster than the minimum interval. Unknown clients are allowed.
    pub fn can_client_make_request(&self, client_id: &str) -> bool {
        let Some(quota) = self.quotas.get(client_id) else {
            return true;
        };
        self.open_slots(client_id, &quota, true) > 0
    }

    /// Admit up to `wanted` requests for the client in one step and count
    /// them as started. Returns how many were admitted.
    ///
    /// With `check_interval` unset the minimum-interval gate is skipped,
    /// which lets the continuation of an already admitted submission
    /// through. The concurrency limit always applies.
    pub fn reserve(&self, client_id: &str, wanted: usize, check_interval: bool) -> usize {
        if wanted == 0 {
            return 0;
        }
        let now = Instant::now();
        let max = self.config.max_concurrent_per_client;
        match self.quotas.entry(client_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let granted = self.open_slots(client_id, entry.get(), check_interval).min(wanted);
                if granted > 0 {
                    let quota = entry.get_mut();
                    quota.current_requests += granted;
                    quota.last_request_at = now;
                }
                granted
            }
            Entry::Vacant(entry) => {
                let granted = max.min(wanted);
                let mut quota = ClientQuota::new(max, now);
                quota.current_requests = granted;
                entry.insert(quota);
                granted
            }
        }
    }

    fn open_slots(&self, client_id: &str, quota: &ClientQuota, check_interval: bool) -> usize {
        if quota.current_requests >= quota.max_concurrent_requests {
            tracing::debug!(
                client_id,
                current = quota.current_requests,
                "client at concurrency limit"
            );
            return 0;
        }
        if check_interval {
            let since_last = quota.last_request_at.elapsed();
            if since_last < self.min_request_interval() {
                tracing::debug!(
                    client_id,
                    since_last_ms = since_last.as_millis() as u64,
                    "client below minimum interval"
                );
                return 0;
            }
        }
        quota.max_concurrent_requests - quota.current_requests
    }

    /// Nudge priority by one level toward an equal share of processed work.
    pub fn adjust_priority_for_fairness(&self, client_id: &str, priority: u8) -> u8 {
        let total = self.total_processed.load(Ordering::Relaxed);
        let active = self.quotas.len();
        if total == 0 || active == 0 {
            return priority;
        }
        let Some(quota) = self.quotas.get(client_id) else {
            return priority;
        };

        let share = quota.total_requests as f64 / total as f64;
        let expected = 1.0 / active as f64;
        let tolerance = self.config.share_tolerance;
        if share < expected * (1.0 - tolerance) {
            priority.saturating_sub(1).max(PRIORITY_HIGHEST)
        } else if share > expected * (1.0 + tolerance) {
            (priority + 1).min(PRIORITY_LOWEST)
        } else {
            priority
        }
    }

    /// A request for the client entered service.
    pub fn record_request_start(&self, client_id: &str) {
        let now = Instant::now();
        let max = self.config.max_concurrent_per_client;
        let mut quota = self
            .quotas
            .entry(client_id.to_string())
            .or_insert_with(|| ClientQuota::new(max, now));
        quota.current_requests += 1;
        quota.last_request_at = now;
    }

    /// A request for the client finished after waiting `wait` in the queue
    /// and `processing` in execution.
    pub fn record_request_completion(&self, client_id: &str, wait: Duration, processing: Duration) {
        if let Some(mut quota) = self.quotas.get_mut(client_id) {
            quota.current_requests = quota.current_requests.saturating_sub(1);
            quota.total_requests += 1;
            quota.total_wait_time += wait;
        }
        let n = self.total_processed.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_average(processing, n);
    }

    fn update_average(&self, processing: Duration, n: u64) {
        let sample = processing.as_secs_f64() * 1000.0;
        let _ = self
            .avg_processing_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let avg = f64::from_bits(bits);
                Some(f64::to_bits(avg + (sample - avg) / n as f64))
            });
    }

    /// Drop quotas with nothing in flight that have been idle too long.
    pub fn purge_idle(&self) -> usize {
        let idle = self.config.idle_timeout;
        let before = self.quotas.len();
        self.quotas
            .retain(|_, q| q.current_requests > 0 || q.last_request_at.elapsed() < idle);
        let purged = before.saturating_sub(self.quotas.len());
        if purged > 0 {
            tracing::debug!(purged, "purged idle client quotas");
        }
        purged
    }

    pub fn client_quota(&self, client_id: &str) -> Option<ClientQuota> {
        self.quotas.get(client_id).map(|q| q.clone())
    }

    pub fn active_clients(&self) -> usize {
        self.quotas.len()
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    pub fn average_processing_time(&self) -> Duration {
        let ms = f64::from_bits(self.avg_processing_ms.load(Ordering::Relaxed));
        Duration::from_secs_f64(ms.max(0.0) / 1000.0)
    }
}

impl Default for FairnessManager {
    fn default() -> Self {
        Self::new(FairnessConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(fm: &FairnessManager, client: &str, n: usize) {
        for _ in 0..n {
            fm.record_request_start(client);
            let tick = Duration::from_millis(1);
            fm.record_request_completion(client, tick, tick);
        }
    }

    #[test]
    fn unknown_client_is_allowed() {
        let fm = FairnessManager::default();
        assert!(fm.can_client_make_request("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_denies() {
        let fm = FairnessManager::new(FairnessConfig {
            max_concurrent_per_client: 2,
            ..Default::default()
        });
        fm.record_request_start("c");
        fm.record_request_start("c");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!fm.can_client_make_request("c"));

        fm.record_request_completion("c", Duration::ZERO, Duration::ZERO);
        assert!(fm.can_client_make_request("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn minimum_interval_denies_bursts() {
        let fm = FairnessManager::default();
        fm.record_request_start("c");
        assert!(!fm.can_client_make_request("c"));
        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(fm.can_client_make_request("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_admits_up_to_the_concurrency_limit() {
        let fm = FairnessManager::new(FairnessConfig {
            max_concurrent_per_client: 3,
            ..Default::default()
        });
        assert_eq!(fm.reserve("c", 5, true), 3);
        assert_eq!(fm.client_quota("c").unwrap().current_requests, 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(fm.reserve("c", 1, true), 0);
        fm.record_request_completion("c", Duration::ZERO, Duration::ZERO);
        assert_eq!(fm.reserve("c", 4, true), 1);
        assert_eq!(fm.client_quota("c").unwrap().current_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_can_skip_the_interval_gate() {
        let fm = FairnessManager::default();
        assert_eq!(fm.reserve("c", 2, true), 2);
        fm.record_request_completion("c", Duration::ZERO, Duration::ZERO);
        fm.record_request_completion("c", Duration::ZERO, Duration::ZERO);

        // Still inside the minimum interval.
        assert_eq!(fm.reserve("c", 2, true), 0);
        assert_eq!(fm.reserve("c", 2, false), 2);
        assert_eq!(fm.reserve("other", 0, true), 0);
    }

    #[test]
    fn interval_tracks_processing_time() {
        let fm = FairnessManager::default();
        fm.record_request_start("c");
        fm.record_request_completion("c", Duration::ZERO, Duration::from_millis(500));
        assert_eq!(fm.min_request_interval(), Duration::from_millis(50));
    }

    #[test]
    fn underserved_client_is_promoted_overserved_demoted() {
        let fm = FairnessManager::default();
        complete(&fm, "heavy", 8);
        complete(&fm, "light", 2);
        // Equal share is 0.5: heavy has 0.8, light has 0.2.
        assert_eq!(fm.adjust_priority_for_fairness("heavy", 5), 6);
        assert_eq!(fm.adjust_priority_for_fairness("light", 5), 4);
    }

    #[test]
    fn balanced_clients_are_unchanged() {
        let fm = FairnessManager::default();
        complete(&fm, "a", 5);
        complete(&fm, "b", 5);
        assert_eq!(fm.adjust_priority_for_fairness("a", 5), 5);
    }

    #[test]
    fn adjustment_respects_bounds() {
        let fm = FairnessManager::default();
        complete(&fm, "heavy", 9);
        complete(&fm, "light", 1);
        assert_eq!(fm.adjust_priority_for_fairness("light", PRIORITY_HIGHEST), PRIORITY_HIGHEST);
        assert_eq!(fm.adjust_priority_for_fairness("heavy", PRIORITY_LOWEST), PRIORITY_LOWEST);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_quotas_are_purged() {
        let fm = FairnessManager::new(FairnessConfig {
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        complete(&fm, "idle", 1);
        fm.record_request_start("busy");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(fm.purge_idle(), 1);
        assert!(fm.client_quota("idle").is_none());
        assert!(fm.client_quota("busy").is_some());
    }

    #[test]
    fn completion_updates_wait_stats() {
        let fm = FairnessManager::default();
        fm.record_request_start("c");
        fm.record_request_completion("c", Duration::from_millis(40), Duration::ZERO);
        fm.record_request_start("c");
        fm.record_request_completion("c", Duration::from_millis(20), Duration::ZERO);
        let quota = fm.client_quota("c").unwrap();
        assert_eq!(quota.total_requests, 2);
        assert_eq!(quota.average_wait_time(), Duration::from_millis(30));
        assert_eq!(quota.current_requests, 0);
    }
}
