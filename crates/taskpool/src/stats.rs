//! Pool statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::pool::PoolStatus;

/// Monotonic counters updated by workers and the supervisor
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) worker_crashes: AtomicU64,
    pub(crate) workers_spawned: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            worker_crashes: self.worker_crashes.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
        }
    }
}

/// Lifetime totals since the pool was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    /// Failed tasks, timeouts excluded
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub retries: u64,
    pub worker_crashes: u64,
    pub workers_spawned: u64,
}

impl CounterSnapshot {
    /// Tasks that reached a terminal state
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled + self.timed_out
    }
}

/// Point-in-time view of the pool
///
/// Worker counts come from one lock acquisition, so `idle_workers +
/// busy_workers` never exceeds `live_workers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub status: PoolStatus,
    /// Tasks waiting in the queue
    pub queued: usize,
    /// Tasks being executed right now
    pub running: usize,
    /// Tasks submitted but not yet resolved (queued, running or awaiting retry)
    pub pending: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub live_workers: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub counters: CounterSnapshot,
}

impl PoolStats {
    /// Fraction of the worker budget in use (0.0-1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_workers == 0 {
            return 0.0;
        }
        self.busy_workers as f64 / self.max_workers as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_snapshot() {
        let counters = PoolCounters::default();
        PoolCounters::incr(&counters.submitted);
        PoolCounters::incr(&counters.submitted);
        PoolCounters::incr(&counters.succeeded);
        PoolCounters::incr(&counters.timed_out);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.completed(), 2);
    }

    #[test]
    fn test_utilization() {
        let stats = PoolStats {
            status: PoolStatus::Running,
            queued: 0,
            running: 3,
            pending: 3,
            idle_workers: 1,
            busy_workers: 3,
            live_workers: 4,
            max_workers: 4,
            queue_capacity: 8,
            counters: CounterSnapshot::default(),
        };
        assert!((stats.utilization() - 0.75).abs() < f64::EPSILON);
    }
}
