//! Request prioritization.
//!
//! Binary min-heap ordered by (priority, arrival time). Lower priority
//! values are dequeued first; equal priorities dequeue in arrival order.

use std::cmp::Ordering;

use tokio::time::Instant;

use crate::request::WorkItem;

/// Anything the queue can order.
pub trait Prioritized {
    fn priority(&self) -> u8;
    fn set_priority(&mut self, priority: u8);
    fn arrived_at(&self) -> Instant;
}

impl Prioritized for WorkItem {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    fn arrived_at(&self) -> Instant {
        self.arrived_at
    }
}

/// Returned when enqueueing into a full queue; carries the item back.
#[derive(Debug)]
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Heap slot. `sequence` breaks ties between identical arrival instants.
#[derive(Debug)]
struct Slot<T> {
    sequence: u64,
    item: T,
}

/// Bounded priority queue with in-place priority mutation.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: Vec<Slot<T>>,
    capacity: usize,
    next_sequence: u64,
}

impl<T: Prioritized> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::new(),
            capacity,
            next_sequence: 0,
        }
    }

    /// Unbounded queue.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn enqueue(&mut self, item: T) -> Result<(), QueueFull<T>> {
        if self.heap.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "priority queue overflow");
            return Err(QueueFull(item));
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Slot { sequence, item });
        self.sift_up(self.heap.len() - 1);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let slot = self.heap.pop()?;
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(slot.item)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.first().map(|s| &s.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate in heap order (not dequeue order).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|s| &s.item)
    }

    /// Change the priority of the first item matching `pred` in place and
    /// restore the heap. The item keeps its arrival time, so it still ranks
    /// behind older items of the new priority.
    ///
    /// Returns the new priority if an item matched.
    pub fn update_priority<P, F>(&mut self, pred: P, f: F) -> Option<u8>
    where
        P: Fn(&T) -> bool,
        F: FnOnce(u8) -> u8,
    {
        let index = self.heap.iter().position(|s| pred(&s.item))?;
        let old = self.heap[index].item.priority();
        let new = f(old);
        self.heap[index].item.set_priority(new);
        match new.cmp(&old) {
            Ordering::Less => self.sift_up(index),
            Ordering::Greater => self.sift_down(index),
            Ordering::Equal => {}
        }
        Some(new)
    }

    /// Remove the first item matching `pred`.
    pub fn remove<P>(&mut self, pred: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let index = self.heap.iter().position(|s| pred(&s.item))?;
        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        let slot = self.heap.pop()?;
        if index < self.heap.len() {
            self.sift_down(index);
            self.sift_up(index);
        }
        Some(slot.item)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (x, y) = (&self.heap[a], &self.heap[b]);
        (x.item.priority(), x.item.arrived_at(), x.sequence)
            < (y.item.priority(), y.item.arrived_at(), y.sequence)
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.heap.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.heap.swap(index, smallest);
            index = smallest;
        }
    }
}

impl<T: Prioritized> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}
