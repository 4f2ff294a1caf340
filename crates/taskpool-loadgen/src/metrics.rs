//! Latency and outcome collection for load runs

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use taskpool::TaskError;

/// Histogram for latency measurements
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Raw samples (for percentile calculation)
    samples: Mutex<Vec<Duration>>,
    sum_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            sum_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
        }
    }

    /// Record a latency sample
    pub fn record(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;

        self.samples.lock().push(duration);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.min_micros.fetch_min(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.samples.lock().len() as u64
    }

    pub fn mean(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_micros.load(Ordering::Relaxed) / count)
    }

    pub fn min(&self) -> Duration {
        match self.min_micros.load(Ordering::Relaxed) {
            u64::MAX => Duration::ZERO,
            min => Duration::from_micros(min),
        }
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_micros.load(Ordering::Relaxed))
    }

    /// Calculate percentile (0.0 to 1.0)
    pub fn percentile(&self, p: f64) -> Duration {
        let mut samples = self.samples.lock();
        if samples.is_empty() {
            return Duration::ZERO;
        }

        samples.sort_unstable();
        let idx = ((samples.len() as f64 * p) as usize).min(samples.len() - 1);
        samples[idx]
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count(),
            mean: self.mean(),
            min: self.min(),
            max: self.max(),
            p50: self.percentile(0.50),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
        }
    }
}

/// Summary statistics for latency
#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// How submitted tasks ended, as seen by the caller
#[derive(Debug, Default)]
pub struct Outcomes {
    succeeded: AtomicU64,
    failed: AtomicU64,
    crashed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

impl Outcomes {
    pub fn record<T>(&self, result: &Result<T, TaskError>) {
        let counter = match result {
            Ok(_) => &self.succeeded,
            Err(TaskError::WorkerCrashed { .. }) => &self.crashed,
            Err(TaskError::TimedOut { .. }) => &self.timed_out,
            Err(TaskError::Cancelled) => &self.cancelled,
            Err(TaskError::Execution { .. }) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Submission refused by the pool (queue full or closed)
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OutcomeSnapshot {
        OutcomeSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            crashed: self.crashed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub crashed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

impl OutcomeSnapshot {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.crashed + self.timed_out + self.cancelled + self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_summary() {
        let histogram = LatencyHistogram::new();
        for ms in 1..=100 {
            histogram.record(Duration::from_millis(ms));
        }

        let summary = histogram.summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, Duration::from_millis(1));
        assert_eq!(summary.max, Duration::from_millis(100));
        assert_eq!(summary.p50, Duration::from_millis(51));
        assert_eq!(summary.p99, Duration::from_millis(100));
        assert_eq!(summary.mean, Duration::from_micros(50_500));
    }

    #[test]
    fn test_empty_histogram() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.min(), Duration::ZERO);
        assert_eq!(histogram.mean(), Duration::ZERO);
        assert_eq!(histogram.percentile(0.5), Duration::ZERO);
    }

    #[test]
    fn test_outcomes() {
        let outcomes = Outcomes::default();
        outcomes.record(&Ok::<_, TaskError>(1));
        outcomes.record::<u32>(&Err(TaskError::Cancelled));
        outcomes.record::<u32>(&Err(TaskError::retryable("x")));
        outcomes.record_rejected();

        let snapshot = outcomes.snapshot();
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.total(), 4);
    }
}
