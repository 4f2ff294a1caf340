//! Load scenario configuration and synthetic work

use std::env;
use std::time::Duration;

use rand::Rng;
use taskpool::prelude::*;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ScenarioError {
    var: &'static str,
    value: String,
}

/// Load scenario
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Total tasks to submit
    pub tasks: u64,
    /// Concurrent submitting tasks
    pub submitters: usize,
    /// Mean simulated work duration
    pub work_time: Duration,
    /// Probability (0.0-1.0) that an attempt fails with a retryable error
    pub failure_rate: f64,
    /// Probability (0.0-1.0) that an attempt panics
    pub panic_rate: f64,
    /// Drain on exit (true) or cancel whatever is left (false)
    pub graceful: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            tasks: 1_000,
            submitters: 4,
            work_time: Duration::from_millis(5),
            failure_rate: 0.05,
            panic_rate: 0.0,
            graceful: true,
        }
    }
}

impl Scenario {
    /// Create a scenario from environment variables
    ///
    /// Environment variables (all optional):
    /// - `LOADGEN_TASKS`: total tasks (default: 1000)
    /// - `LOADGEN_SUBMITTERS`: concurrent submitters (default: 4)
    /// - `LOADGEN_WORK_MS`: mean work duration (default: 5)
    /// - `LOADGEN_FAILURE_RATE`: retryable failure probability (default: 0.05)
    /// - `LOADGEN_PANIC_RATE`: panic probability (default: 0.0)
    /// - `LOADGEN_GRACEFUL`: `true` to drain on exit (default: true)
    pub fn from_env() -> Result<Self, ScenarioError> {
        let defaults = Self::default();
        Ok(Self {
            tasks: parse_env("LOADGEN_TASKS")?.unwrap_or(defaults.tasks),
            submitters: parse_env::<usize>("LOADGEN_SUBMITTERS")?
                .unwrap_or(defaults.submitters)
                .max(1),
            work_time: parse_env("LOADGEN_WORK_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.work_time),
            failure_rate: parse_rate("LOADGEN_FAILURE_RATE")?.unwrap_or(defaults.failure_rate),
            panic_rate: parse_rate("LOADGEN_PANIC_RATE")?.unwrap_or(defaults.panic_rate),
            graceful: parse_env("LOADGEN_GRACEFUL")?.unwrap_or(defaults.graceful),
        })
    }

    pub fn work(&self, index: u64) -> SyntheticWork {
        SyntheticWork {
            index,
            work_time: self.work_time,
            failure_rate: self.failure_rate,
            panic_rate: self.panic_rate,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ScenarioError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ScenarioError { var, value }),
        Err(_) => Ok(None),
    }
}

/// A probability, clamped to 0.0-1.0; NaN and infinities are rejected
fn parse_rate(var: &'static str) -> Result<Option<f64>, ScenarioError> {
    parse_env::<f64>(var)?.map(|rate| check_rate(var, rate)).transpose()
}

fn check_rate(var: &'static str, rate: f64) -> Result<f64, ScenarioError> {
    if rate.is_finite() {
        Ok(rate.clamp(0.0, 1.0))
    } else {
        Err(ScenarioError {
            var,
            value: rate.to_string(),
        })
    }
}

/// Work that sleeps for a jittered duration and fails or panics at random
#[derive(Debug, Clone)]
pub struct SyntheticWork {
    index: u64,
    work_time: Duration,
    failure_rate: f64,
    panic_rate: f64,
}

#[async_trait]
impl Work for SyntheticWork {
    type Output = u64;

    async fn run(&self, ctx: &TaskContext) -> Result<u64, TaskError> {
        let (sleep, fail, explode) = {
            let mut rng = rand::thread_rng();
            let factor = rng.gen_range(0.5..1.5);
            (
                self.work_time.mul_f64(factor),
                rng.gen_bool(self.failure_rate),
                rng.gen_bool(self.panic_rate),
            )
        };

        tokio::select! {
            _ = ctx.cancelled() => return Err(TaskError::Cancelled),
            _ = tokio::time::sleep(sleep) => {}
        }

        if explode {
            panic!("synthetic panic in task {}", self.index);
        }
        if fail {
            return Err(TaskError::retryable(format!(
                "synthetic failure in task {} (attempt {})",
                self.index, ctx.attempt
            )));
        }
        Ok(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let scenario = Scenario::default();
        assert_eq!(scenario.tasks, 1_000);
        assert!(scenario.graceful);
    }

    #[test]
    fn test_rates_must_be_finite() {
        assert_eq!(check_rate("LOADGEN_FAILURE_RATE", 0.25).unwrap(), 0.25);
        assert_eq!(check_rate("LOADGEN_FAILURE_RATE", 3.0).unwrap(), 1.0);
        assert_eq!(check_rate("LOADGEN_PANIC_RATE", -1.0).unwrap(), 0.0);

        let err = check_rate("LOADGEN_FAILURE_RATE", "NaN".parse().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for LOADGEN_FAILURE_RATE: \"NaN\"");
        assert!(check_rate("LOADGEN_PANIC_RATE", f64::INFINITY).is_err());
    }

    #[tokio::test]
    async fn test_synthetic_work_succeeds_without_failures() {
        let pool = WorkerPool::new(PoolConfig::new(2, 8)).unwrap();
        pool.start().await.unwrap();

        let scenario = Scenario {
            tasks: 1,
            submitters: 1,
            work_time: Duration::from_millis(1),
            failure_rate: 0.0,
            panic_rate: 0.0,
            graceful: true,
        };
        let handle = pool.submit(scenario.work(9)).await.unwrap();
        assert_eq!(handle.wait().await, Ok(9));

        pool.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_synthetic_work_always_failing() {
        let pool = WorkerPool::new(PoolConfig::new(1, 8)).unwrap();
        pool.start().await.unwrap();

        let scenario = Scenario {
            failure_rate: 1.0,
            work_time: Duration::from_millis(1),
            ..Scenario::default()
        };
        let handle = pool.submit(scenario.work(3)).await.unwrap();
        assert!(matches!(handle.wait().await, Err(TaskError::Execution { retryable: true, .. })));

        pool.shutdown(true).await.unwrap();
    }
}
