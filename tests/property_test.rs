//! Property tests for the priority heap and the LRU bound.

use std::time::Duration;

use dispatch_core::dedup::{DedupConfig, DeduplicationCache};
use dispatch_core::request::{BatchedResponse, ExecutionOutput, Method, WorkItem};
use dispatch_core::scheduler::PriorityQueue;
use proptest::prelude::*;

fn item(n: usize, priority: u8) -> WorkItem {
    WorkItem::new(format!("i{n}"), Method::Get, "/p").with_priority(priority)
}

proptest! {
    #[test]
    fn dequeue_matches_stable_sort_by_priority(priorities in prop::collection::vec(1u8..=10, 0..200)) {
        let mut queue = PriorityQueue::unbounded();
        for (n, p) in priorities.iter().enumerate() {
            queue.enqueue(item(n, *p)).unwrap();
        }

        let mut expected: Vec<(u8, String)> = priorities
            .iter()
            .enumerate()
            .map(|(n, p)| (*p, format!("i{n}")))
            .collect();
        expected.sort_by_key(|(p, _)| *p);

        let actual: Vec<(u8, String)> = std::iter::from_fn(|| queue.dequeue())
            .map(|w| (w.priority, w.id))
            .collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn heap_stays_ordered_after_priority_updates(
        priorities in prop::collection::vec(1u8..=10, 1..100),
        updates in prop::collection::vec((any::<prop::sample::Index>(), 1u8..=10), 0..50),
    ) {
        let mut queue = PriorityQueue::unbounded();
        for (n, p) in priorities.iter().enumerate() {
            queue.enqueue(item(n, *p)).unwrap();
        }
        for (index, new_priority) in updates {
            let target = format!("i{}", index.index(priorities.len()));
            queue.update_priority(|w: &WorkItem| w.id == target, |_| new_priority);
        }

        let mut last = 0u8;
        let mut count = 0;
        while let Some(w) = queue.dequeue() {
            prop_assert!(w.priority >= last);
            last = w.priority;
            count += 1;
        }
        prop_assert_eq!(count, priorities.len());
    }

    #[test]
    fn cache_never_exceeds_capacity(capacity in 1usize..20, extra in 0usize..20) {
        let cache = DeduplicationCache::new(DedupConfig {
            max_cache_size: capacity,
            ..Default::default()
        });
        for n in 0..capacity + extra {
            let key = format!("k{n}");
            let response = BatchedResponse::from_output(
                key.as_str(),
                ExecutionOutput::ok(serde_json::json!(n)),
                Duration::ZERO,
            );
            cache.set_response(&key, response);
        }

        prop_assert_eq!(cache.len(), capacity);
        // Nothing was read back, so the oldest inserts are the ones evicted.
        for n in 0..extra {
            let evicted = format!("k{}", n);
            prop_assert!(!cache.has_response(&evicted));
        }
        for n in extra..capacity + extra {
            let kept = format!("k{}", n);
            prop_assert!(cache.has_response(&kept));
        }
        prop_assert_eq!(cache.stats().evictions, extra as u64);
    }
}
