//! Request scheduler: fairness admission, starvation prevention and
//! least-loaded dispatch over a set of priority queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::balancer::{LoadBalancer, LoadBalancerConfig};
use super::fairness::{FairnessConfig, FairnessManager};
use super::priority::QueueFull;
use crate::error::{CoreError, RejectReason};
use crate::request::{WorkItem, PRIORITY_HIGHEST};
use crate::telemetry;

/// Tracking entries older than this many thresholds with no queued item
/// are considered stale.
const STALE_TRACKING_FACTOR: u32 = 10;

/// Configuration for the request scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enable_fairness: bool,
    pub starvation_threshold: Duration,
    /// Priority levels gained per starvation boost.
    pub starvation_boost: u8,
    pub maintenance_interval: Duration,
    pub stats_interval: Duration,
    pub balancer: LoadBalancerConfig,
    pub fairness: FairnessConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_fairness: true,
            starvation_threshold: Duration::from_millis(5000),
            starvation_boost: 2,
            maintenance_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(300),
            balancer: LoadBalancerConfig::default(),
            fairness: FairnessConfig::default(),
        }
    }
}

/// Aggregate scheduler statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub fairness_rejections: u64,
    pub overflow_rejections: u64,
    pub starvation_boosts: u64,
    pub starvation_events: u64,
    pub average_wait_ms: f64,
    pub queue_sizes: Vec<usize>,
    pub queued: usize,
    pub active_clients: usize,
}

/// Result of ordering a batch through the scheduler.
#[derive(Debug, Default)]
pub struct BatchOrder {
    /// Admitted items in dispatch order.
    pub ordered: Vec<WorkItem>,
    pub rejected: Vec<(WorkItem, CoreError)>,
}

struct Tracked {
    enqueued_at: Instant,
    last_boost: Instant,
    queue: usize,
}

struct InService {
    dequeued_at: Instant,
    wait: Duration,
}

struct SchedulerState {
    balancer: LoadBalancer,
    tracked: HashMap<String, Tracked>,
    in_service: HashMap<String, InService>,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    fairness_rejections: AtomicU64,
    overflow_rejections: AtomicU64,
    boosts: AtomicU64,
    starvation_events: AtomicU64,
    /// f64 bits of the running average wait in milliseconds.
    avg_wait_ms: AtomicU64,
}

/// Composes the queues, fairness quotas and starvation prevention.
pub struct RequestScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    fairness: FairnessManager,
    counters: Counters,
}

impl RequestScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                balancer: LoadBalancer::new(&config.balancer),
                tracked: HashMap::new(),
                in_service: HashMap::new(),
            }),
            fairness: FairnessManager::new(config.fairness.clone()),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn fairness(&self) -> &FairnessManager {
        &self.fairness
    }

    /// Admit, adjust and enqueue an item.
    ///
    /// Fairness denials and full queues are reported as distinct
    /// `SchedulingRejected` reasons; both are retryable.
    pub fn schedule_request(&self, mut item: WorkItem) -> Result<(), CoreError> {
        if self.config.enable_fairness {
            if let Some(client) = item.client_id.as_deref() {
                if !self.fairness.can_client_make_request(client) {
                    return Err(self.reject_fairness(&item));
                }
                item.priority = self.fairness.adjust_priority_for_fairness(client, item.priority);
            }
        }

        let id = item.id.clone();
        let client = item.client_id.clone();
        let enqueued_at = item.arrived_at;

        let mut state = self.state.lock();
        self.boost_starving(&mut state);
        let enqueued = state.balancer.enqueue(item);
        let queue = match enqueued {
            Ok(queue) => queue,
            Err(QueueFull(item)) => {
                drop(state);
                self.counters.overflow_rejections.fetch_add(1, Ordering::Relaxed);
                telemetry::record_scheduling_rejection(RejectReason::QueueFull);
                tracing::warn!(
                    request_id = %item.id,
                    client_id = item.client_id.as_deref().unwrap_or("-"),
                    "queue overflow, request rejected"
                );
                return Err(CoreError::SchedulingRejected(RejectReason::QueueFull));
            }
        };
        state.tracked.insert(
            id.clone(),
            Tracked {
                enqueued_at,
                last_boost: enqueued_at,
                queue,
            },
        );
        telemetry::record_queue_depth(queue, state.balancer.queue(queue).map_or(0, |q| q.len()));
        drop(state);

        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        if let Some(client) = client.as_deref() {
            if self.config.enable_fairness {
                self.fairness.record_request_start(client);
            }
        }
        tracing::trace!(request_id = %id, queue, "request scheduled");
        Ok(())
    }

    fn reject_fairness(&self, item: &WorkItem) -> CoreError {
        self.counters.fairness_rejections.fetch_add(1, Ordering::Relaxed);
        telemetry::record_scheduling_rejection(RejectReason::FairnessDenied);
        tracing::info!(
            request_id = %item.id,
            client_id = item.client_id.as_deref().unwrap_or("-"),
            "fairness rejection"
        );
        CoreError::SchedulingRejected(RejectReason::FairnessDenied)
    }

    /// Dequeue from the least loaded queue.
    pub fn get_next_request(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        self.boost_starving(&mut state);
        let item = state.balancer.dequeue()?;
        let now = Instant::now();
        let wait = state
            .tracked
            .remove(&item.id)
            .map_or_else(|| item.wait_time(), |t| now.saturating_duration_since(t.enqueued_at));
        state.in_service.insert(
            item.id.clone(),
            InService {
                dequeued_at: now,
                wait,
            },
        );
        drop(state);

        if wait > self.config.starvation_threshold {
            self.counters.starvation_events.fetch_add(1, Ordering::Relaxed);
            telemetry::record_starvation_event();
            tracing::warn!(
                request_id = %item.id,
                wait_ms = wait.as_millis() as u64,
                priority = item.priority,
                "request waited past starvation threshold"
            );
        }
        Some(item)
    }

    /// Record the outcome of a dequeued item.
    pub fn complete_request(&self, item: &WorkItem, success: bool) {
        let (wait, processing) = match self.state.lock().in_service.remove(&item.id) {
            Some(s) => (s.wait, s.dequeued_at.elapsed()),
            None => (Duration::ZERO, item.wait_time()),
        };

        let n = self.counters.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if !success {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        let sample = wait.as_secs_f64() * 1000.0;
        let _ = self
            .counters
            .avg_wait_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let avg = f64::from_bits(bits);
                Some(f64::to_bits(avg + (sample - avg) / n as f64))
            });

        if let Some(client) = item.client_id.as_deref() {
            if self.config.enable_fairness {
                self.fairness.record_request_completion(client, wait, processing);
            }
        }
    }

    /// Admit and order a batch without touching the shared queues, so
    /// concurrent batches never dequeue each other's items.
    ///
    /// Each client is admitted up to its free concurrency slots, most
    /// urgent items first, and only the overflow is rejected. Admitted
    /// items are stably sorted by fairness-adjusted priority, then arrival.
    pub fn order_batch(&self, items: Vec<WorkItem>) -> BatchOrder {
        self.order_batch_with(items, true)
    }

    /// [`order_batch`](Self::order_batch) with control over the per-client
    /// minimum interval. Later chunks of one submission skip it.
    pub fn order_batch_with(&self, mut items: Vec<WorkItem>, check_interval: bool) -> BatchOrder {
        let mut order = BatchOrder::default();
        if items.is_empty() {
            return order;
        }
        items.sort_by_key(|item| (item.priority, item.arrived_at));

        let mut allowance: HashMap<String, usize> = HashMap::new();
        if self.config.enable_fairness {
            let mut wanted: HashMap<&str, usize> = HashMap::new();
            for client in items.iter().filter_map(|i| i.client_id.as_deref()) {
                *wanted.entry(client).or_default() += 1;
            }
            for (client, n) in wanted {
                let granted = self.fairness.reserve(client, n, check_interval);
                allowance.insert(client.to_string(), granted);
            }
        }

        for mut item in items {
            let client = item.client_id.clone().filter(|_| self.config.enable_fairness);
            let Some(client) = client else {
                order.ordered.push(item);
                continue;
            };
            let admitted = allowance.get_mut(&client).map_or(false, |left| {
                let open = *left > 0;
                if open {
                    *left -= 1;
                }
                open
            });
            if admitted {
                item.priority = self.fairness.adjust_priority_for_fairness(&client, item.priority);
                order.ordered.push(item);
            } else {
                let err = self.reject_fairness(&item);
                order.rejected.push((item, err));
            }
        }
        order.ordered.sort_by_key(|item| (item.priority, item.arrived_at));

        let now = Instant::now();
        let mut state = self.state.lock();
        for item in &order.ordered {
            state.in_service.insert(
                item.id.clone(),
                InService {
                    dequeued_at: now,
                    wait: item.wait_time(),
                },
            );
        }
        drop(state);
        self.counters
            .scheduled
            .fetch_add(order.ordered.len() as u64, Ordering::Relaxed);
        order
    }

    /// Boost every queued item that has waited a full threshold since its
    /// arrival or last boost. Returns the number of items boosted.
    pub fn prevent_starvation(&self) -> usize {
        let mut state = self.state.lock();
        self.boost_starving(&mut state)
    }

    fn boost_starving(&self, state: &mut SchedulerState) -> usize {
        let threshold = self.config.starvation_threshold;
        let now = Instant::now();
        let due: Vec<(String, usize)> = state
            .tracked
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_boost) >= threshold)
            .map(|(id, t)| (id.clone(), t.queue))
            .collect();

        let mut boosted = 0;
        for (id, queue_index) in due {
            if let Some(tracked) = state.tracked.get_mut(&id) {
                tracked.last_boost = now;
            }
            let Some(queue) = state.balancer.queue_mut(queue_index) else {
                continue;
            };
            let mut old = PRIORITY_HIGHEST;
            let boost = self.config.starvation_boost;
            let new = queue.update_priority(
                |w| w.id == id,
                |p| {
                    old = p;
                    p.saturating_sub(boost).max(PRIORITY_HIGHEST)
                },
            );
            if let Some(new) = new.filter(|n| *n < old) {
                boosted += 1;
                self.counters.boosts.fetch_add(1, Ordering::Relaxed);
                telemetry::record_starvation_boost();
                tracing::debug!(request_id = %id, from = old, to = new, "starvation boost");
            }
        }
        boosted
    }

    /// Purge idle fairness quotas and stale starvation tracking.
    pub fn maintenance(&self) -> (usize, usize) {
        let purged_quotas = self.fairness.purge_idle();
        let stale_age = self.config.starvation_threshold * STALE_TRACKING_FACTOR;
        let now = Instant::now();

        let mut state = self.state.lock();
        let stale: Vec<String> = state
            .tracked
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.enqueued_at) > stale_age)
            .filter(|(id, t)| {
                state
                    .balancer
                    .queue(t.queue)
                    .map_or(true, |q| !q.iter().any(|w| &w.id == *id))
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.tracked.remove(id);
        }
        (purged_quotas, stale.len())
    }

    /// Log and export a statistics snapshot.
    pub fn log_statistics(&self) {
        let stats = self.stats();
        for (queue, depth) in stats.queue_sizes.iter().enumerate() {
            telemetry::record_queue_depth(queue, *depth);
        }
        tracing::info!(
            scheduled = stats.total_scheduled,
            processed = stats.total_processed,
            failed = stats.total_failed,
            fairness_rejections = stats.fairness_rejections,
            overflow_rejections = stats.overflow_rejections,
            starvation_boosts = stats.starvation_boosts,
            starvation_events = stats.starvation_events,
            average_wait_ms = stats.average_wait_ms,
            queued = stats.queued,
            active_clients = stats.active_clients,
            "scheduler statistics"
        );
    }

    /// Spawn the periodic maintenance and statistics tasks.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut maintenance = tokio::time::interval(scheduler.config.maintenance_interval);
            let mut statistics = tokio::time::interval(scheduler.config.stats_interval);
            maintenance.tick().await;
            statistics.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = maintenance.tick() => {
                        let (quotas, stale) = scheduler.maintenance();
                        scheduler.prevent_starvation();
                        tracing::debug!(quotas, stale, "scheduler maintenance");
                    }
                    _ = statistics.tick() => scheduler.log_statistics(),
                }
            }
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let c = &self.counters;
        SchedulerStats {
            total_scheduled: c.scheduled.load(Ordering::Relaxed),
            total_processed: c.processed.load(Ordering::Relaxed),
            total_failed: c.failed.load(Ordering::Relaxed),
            fairness_rejections: c.fairness_rejections.load(Ordering::Relaxed),
            overflow_rejections: c.overflow_rejections.load(Ordering::Relaxed),
            starvation_boosts: c.boosts.load(Ordering::Relaxed),
            starvation_events: c.starvation_events.load(Ordering::Relaxed),
            average_wait_ms: f64::from_bits(c.avg_wait_ms.load(Ordering::Relaxed)),
            queue_sizes: state.balancer.sizes(),
            queued: state.balancer.len(),
            active_clients: self.fairness.active_clients(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().balancer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().balancer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn single_queue(enable_fairness: bool) -> SchedulerConfig {
        SchedulerConfig {
            enable_fairness,
            starvation_threshold: Duration::from_millis(100),
            balancer: LoadBalancerConfig {
                queue_count: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn item(id: &str, priority: u8) -> WorkItem {
        WorkItem::new(id, Method::Get, "/x").with_priority(priority)
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_by_priority() {
        let scheduler = RequestScheduler::new(single_queue(false));
        scheduler.schedule_request(item("low", 9)).unwrap();
        scheduler.schedule_request(item("high", 1)).unwrap();
        scheduler.schedule_request(item("mid", 5)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| scheduler.get_next_request())
            .map(|w| w.id)
            .collect();
        assert_eq!(order, ["high", "mid", "low"]);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn starving_item_is_boosted_in_place() {
        let scheduler = RequestScheduler::new(single_queue(false));
        scheduler.schedule_request(item("starved", 9)).unwrap();
        scheduler.schedule_request(item("fresh", 7)).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(scheduler.prevent_starvation(), 2);

        // Both moved up two levels and keep their relative order.
        let first = scheduler.get_next_request().unwrap();
        assert_eq!(first.id, "fresh");
        assert_eq!(first.priority, 5);
        let second = scheduler.get_next_request().unwrap();
        assert_eq!((second.id.as_str(), second.priority), ("starved", 7));

        let stats = scheduler.stats();
        assert_eq!(stats.starvation_boosts, 2);
        assert_eq!(stats.starvation_events, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn boost_resets_after_each_threshold() {
        let scheduler = RequestScheduler::new(single_queue(false));
        scheduler.schedule_request(item("a", 9)).unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(scheduler.prevent_starvation(), 1);
        // Not due again until another full threshold passes.
        assert_eq!(scheduler.prevent_starvation(), 0);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(scheduler.prevent_starvation(), 1);
        assert_eq!(scheduler.get_next_request().unwrap().priority, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn boost_stops_at_highest_priority() {
        let scheduler = RequestScheduler::new(single_queue(false));
        scheduler.schedule_request(item("a", 1)).unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(scheduler.prevent_starvation(), 0);
        assert_eq!(scheduler.get_next_request().unwrap().priority, PRIORITY_HIGHEST);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_is_rejected() {
        let mut config = single_queue(false);
        config.balancer.queue_capacity = 1;
        let scheduler = RequestScheduler::new(config);

        scheduler.schedule_request(item("a", 5)).unwrap();
        let err = scheduler.schedule_request(item("b", 5)).unwrap_err();
        assert_eq!(err, CoreError::SchedulingRejected(RejectReason::QueueFull));
        assert!(err.is_retryable());
        assert_eq!(scheduler.stats().overflow_rejections, 1);
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bursting_client_is_denied() {
        let scheduler = RequestScheduler::new(single_queue(true));
        scheduler.schedule_request(item("a", 5).with_client("c")).unwrap();

        let err = scheduler
            .schedule_request(item("b", 5).with_client("c"))
            .unwrap_err();
        assert_eq!(err, CoreError::SchedulingRejected(RejectReason::FairnessDenied));
        assert_eq!(scheduler.stats().fairness_rejections, 1);

        tokio::time::advance(Duration::from_millis(20)).await;
        scheduler.schedule_request(item("b", 5).with_client("c")).unwrap();
        assert_eq!(scheduler.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_updates_stats_and_quota() {
        let scheduler = RequestScheduler::new(single_queue(true));
        scheduler.schedule_request(item("a", 5).with_client("c")).unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;

        let next = scheduler.get_next_request().unwrap();
        scheduler.complete_request(&next, false);

        let stats = scheduler.stats();
        assert_eq!(stats.total_scheduled, 1);
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_failed, 1);
        assert!((stats.average_wait_ms - 40.0).abs() < 1.0);
        let quota = scheduler.fairness().client_quota("c").unwrap();
        assert_eq!(quota.current_requests, 0);
        assert_eq!(quota.total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn order_batch_sorts_and_gates_busy_clients() {
        let scheduler = RequestScheduler::new(single_queue(true));
        // "busy" was just served, so it is inside the minimum interval.
        scheduler.fairness().record_request_start("busy");

        let order = scheduler.order_batch(vec![
            item("1", 9).with_client("new"),
            item("2", 2).with_client("busy"),
            item("3", 1),
            item("4", 3).with_client("new"),
        ]);

        let ids: Vec<&str> = order.ordered.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["3", "4", "1"]);
        assert_eq!(order.rejected.len(), 1);
        assert_eq!(order.rejected[0].0.id, "2");
        // Both items of the admitted client were counted as started.
        assert_eq!(scheduler.fairness().client_quota("new").unwrap().current_requests, 2);
        // Batch items never enter the shared queues.
        assert!(scheduler.is_empty());

        for item in &order.ordered {
            scheduler.complete_request(item, true);
        }
        assert_eq!(scheduler.stats().total_processed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn order_batch_keeps_priority_order_across_clients() {
        let scheduler = RequestScheduler::new(SchedulerConfig {
            starvation_threshold: Duration::from_millis(100),
            ..Default::default()
        });
        let order = scheduler.order_batch(vec![
            item("b1", 10).with_client("b"),
            item("a1", 1).with_client("a"),
            item("a2", 1).with_client("a"),
            item("a3", 1).with_client("a"),
        ]);
        let ids: Vec<&str> = order.ordered.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["a1", "a2", "a3", "b1"]);
        assert!(order.rejected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn order_batch_rejects_only_the_overflow() {
        let mut config = single_queue(true);
        config.fairness.max_concurrent_per_client = 2;
        let scheduler = RequestScheduler::new(config);

        let order = scheduler.order_batch(vec![
            item("late", 8).with_client("c"),
            item("first", 1).with_client("c"),
            item("second", 2).with_client("c"),
            item("other", 5).with_client("d"),
        ]);
        let ids: Vec<&str> = order.ordered.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["first", "second", "other"]);
        assert_eq!(order.rejected.len(), 1);
        assert_eq!(order.rejected[0].0.id, "late");
        assert_eq!(
            order.rejected[0].1,
            CoreError::SchedulingRejected(RejectReason::FairnessDenied)
        );

        let quota = scheduler.fairness().client_quota("c").unwrap();
        assert_eq!(quota.current_requests, quota.max_concurrent_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn continuation_skips_the_interval_gate() {
        let scheduler = RequestScheduler::new(single_queue(true));
        let first = scheduler.order_batch(vec![item("1", 5).with_client("c")]);
        for item in &first.ordered {
            scheduler.complete_request(item, true);
        }

        let denied = scheduler.order_batch(vec![item("2", 5).with_client("c")]);
        assert_eq!(denied.rejected.len(), 1);

        let next = scheduler.order_batch_with(vec![item("3", 5).with_client("c")], false);
        assert!(next.rejected.is_empty());
        assert_eq!(next.ordered[0].id, "3");
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_purges_idle_quotas() {
        let mut config = single_queue(true);
        config.fairness.idle_timeout = Duration::from_secs(1);
        let scheduler = RequestScheduler::new(config);

        scheduler.schedule_request(item("a", 5).with_client("c")).unwrap();
        let next = scheduler.get_next_request().unwrap();
        scheduler.complete_request(&next, true);

        tokio::time::advance(Duration::from_secs(2)).await;
        let (quotas, stale) = scheduler.maintenance();
        assert_eq!((quotas, stale), (1, 0));
        assert_eq!(scheduler.stats().active_clients, 0);
    }
}
