//! Request scheduling.
//!
//! Priority queues, per-client fairness, starvation prevention and
//! least-loaded dispatch across multiple queues.

mod balancer;
mod fairness;
mod priority;
mod queue;

pub use balancer::{LoadBalancer, LoadBalancerConfig};
pub use fairness::{ClientQuota, FairnessConfig, FairnessManager};
pub use priority::{Prioritized, PriorityQueue, QueueFull};
pub use queue::{BatchOrder, RequestScheduler, SchedulerConfig, SchedulerStats};
