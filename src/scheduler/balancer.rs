//! Routing across independent priority queues.
//!
//! Writes are sticky per client (hash of the client id) or round robin for
//! anonymous items. Reads come from the least loaded queue by `size / weight`.

use super::priority::{PriorityQueue, QueueFull};
use crate::dedup::rolling_hash;
use crate::request::WorkItem;

/// Configuration for the queue set.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub queue_count: usize,
    /// Per-queue weights; empty means equal weights.
    pub weights: Vec<f64>,
    pub queue_capacity: usize,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            queue_count: 3,
            weights: Vec::new(),
            queue_capacity: 1000,
        }
    }
}

/// Owns the queues and decides where items go in and come out.
#[derive(Debug)]
pub struct LoadBalancer {
    queues: Vec<PriorityQueue<WorkItem>>,
    weights: Vec<f64>,
    next_round_robin: usize,
}

impl LoadBalancer {
    pub fn new(config: &LoadBalancerConfig) -> Self {
        let count = config.queue_count.max(1);
        let weights = (0..count)
            .map(|i| {
                config
                    .weights
                    .get(i)
                    .copied()
                    .filter(|w| w.is_finite() && *w > 0.0)
                    .unwrap_or(1.0)
            })
            .collect();
        Self {
            queues: (0..count)
                .map(|_| PriorityQueue::new(config.queue_capacity))
                .collect(),
            weights,
            next_round_robin: 0,
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Sticky hash for clients, round robin otherwise.
    pub fn select_queue(&mut self, item: &WorkItem) -> usize {
        match item.client_id.as_deref() {
            Some(client) => self.queue_for_client(client),
            None => {
                let index = self.next_round_robin % self.queues.len();
                self.next_round_robin = self.next_round_robin.wrapping_add(1);
                index
            }
        }
    }

    /// The queue every item of this client lands in.
    pub fn queue_for_client(&self, client_id: &str) -> usize {
        rolling_hash(client_id) as usize % self.queues.len()
    }

    /// Non-empty queue with the smallest `size / weight`; ties go to the
    /// lowest index.
    pub fn select_least_loaded_queue(&self) -> Option<usize> {
        self.queues
            .iter()
            .zip(&self.weights)
            .enumerate()
            .filter(|(_, (q, _))| !q.is_empty())
            .map(|(i, (q, w))| (i, q.len() as f64 / w))
            .fold(None, |best: Option<(usize, f64)>, (i, load)| match best {
                Some((_, best_load)) if best_load <= load => best,
                _ => Some((i, load)),
            })
            .map(|(i, _)| i)
    }

    /// Route and enqueue. Returns the queue index.
    pub fn enqueue(&mut self, item: WorkItem) -> Result<usize, QueueFull<WorkItem>> {
        let index = self.select_queue(&item);
        self.queues[index].enqueue(item)?;
        Ok(index)
    }

    /// Dequeue from the least loaded queue.
    pub fn dequeue(&mut self) -> Option<WorkItem> {
        let index = self.select_least_loaded_queue()?;
        self.queues[index].dequeue()
    }

    pub fn queue(&self, index: usize) -> Option<&PriorityQueue<WorkItem>> {
        self.queues.get(index)
    }

    pub fn queue_mut(&mut self, index: usize) -> Option<&mut PriorityQueue<WorkItem>> {
        self.queues.get_mut(index)
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.queues.iter().map(PriorityQueue::len).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(PriorityQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(PriorityQueue::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(id, Method::Get, "/x")
    }

    #[test]
    fn client_routing_is_sticky() {
        let mut lb = LoadBalancer::new(&LoadBalancerConfig::default());
        let first = lb.select_queue(&item("1").with_client("acme"));
        for i in 0..10 {
            assert_eq!(lb.select_queue(&item(&i.to_string()).with_client("acme")), first);
        }
        assert_eq!(lb.queue_for_client("acme"), first);
    }

    #[test]
    fn anonymous_items_round_robin() {
        let mut lb = LoadBalancer::new(&LoadBalancerConfig::default());
        let picks: Vec<usize> = (0..6).map(|i| lb.select_queue(&item(&i.to_string()))).collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn least_loaded_skips_empty_queues() {
        let mut lb = LoadBalancer::new(&LoadBalancerConfig::default());
        assert_eq!(lb.select_least_loaded_queue(), None);
        // Round robin: queue 0 gets two, queue 1 gets one.
        lb.enqueue(item("a")).unwrap();
        lb.enqueue(item("b")).unwrap();
        lb.select_queue(&item("skip"));
        lb.enqueue(item("c")).unwrap();
        assert_eq!(lb.sizes(), [2, 1, 0]);
        assert_eq!(lb.select_least_loaded_queue(), Some(1));
    }

    #[test]
    fn weights_scale_load() {
        let mut lb = LoadBalancer::new(&LoadBalancerConfig {
            queue_count: 2,
            weights: vec![4.0, 1.0],
            queue_capacity: 100,
        });
        for i in 0..6 {
            lb.enqueue(item(&i.to_string())).unwrap();
        }
        // Both hold 3 items; queue 0 has four times the weight.
        assert_eq!(lb.select_least_loaded_queue(), Some(0));
    }

    #[test]
    fn invalid_weights_default_to_one() {
        let lb = LoadBalancer::new(&LoadBalancerConfig {
            queue_count: 2,
            weights: vec![0.0, f64::NAN],
            queue_capacity: 10,
        });
        assert_eq!(lb.weights, [1.0, 1.0]);
    }

    #[test]
    fn zero_queue_count_is_clamped() {
        let lb = LoadBalancer::new(&LoadBalancerConfig {
            queue_count: 0,
            ..Default::default()
        });
        assert_eq!(lb.queue_count(), 1);
    }
}
