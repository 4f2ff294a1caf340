//! Drive a worker pool with synthetic load and report latency and outcomes
//!
//! Pool settings come from `TASKPOOL_*` variables, the scenario from
//! `LOADGEN_*` variables; both may be placed in a `.env` file.

mod metrics;
mod scenario;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use taskpool::{PoolConfig, PoolError, TracingSink, WorkerPool};
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::metrics::{LatencyHistogram, Outcomes};
use crate::scenario::Scenario;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskpool=info,taskpool_loadgen=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PoolConfig::from_env().context("loading pool configuration")?;
    let scenario = Scenario::from_env().context("loading load scenario")?;
    tracing::info!(?config, ?scenario, "taskpool-loadgen starting");

    let pool = Arc::new(
        WorkerPool::builder()
            .config(config)
            .event_sink(Arc::new(TracingSink))
            .on_worker_crash(|crash| {
                tracing::warn!(worker_id = %crash.worker_id, reason = %crash.reason, "Worker crash reported");
            })
            .build()?,
    );
    pool.start().await?;

    let latency = Arc::new(LatencyHistogram::new());
    let outcomes = Arc::new(Outcomes::default());
    let progress = progress_bar(scenario.tasks);
    let started = Instant::now();

    tokio::select! {
        _ = run_load(&pool, &scenario, &latency, &outcomes, &progress) => {
            progress.finish_with_message("done");
        }
        _ = tokio::signal::ctrl_c() => {
            progress.abandon_with_message("interrupted");
            tracing::warn!("Interrupted, cancelling remaining tasks");
        }
    }

    let elapsed = started.elapsed();
    match pool.shutdown(scenario.graceful).await {
        Ok(()) => {}
        Err(PoolError::ShutdownTimeout(timeout)) => {
            tracing::warn!(?timeout, "Pool did not stop within its shutdown timeout");
        }
        Err(err) => return Err(err.into()),
    }

    report(&pool, &latency, &outcomes, elapsed);
    Ok(())
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

/// Submit every task from `submitters` concurrent producers and await results
async fn run_load(
    pool: &Arc<WorkerPool>,
    scenario: &Scenario,
    latency: &Arc<LatencyHistogram>,
    outcomes: &Arc<Outcomes>,
    progress: &ProgressBar,
) {
    let next = Arc::new(AtomicU64::new(0));
    let mut submitters = JoinSet::new();

    for _ in 0..scenario.submitters {
        let pool = Arc::clone(pool);
        let scenario = scenario.clone();
        let latency = Arc::clone(latency);
        let outcomes = Arc::clone(outcomes);
        let progress = progress.clone();
        let next = Arc::clone(&next);

        submitters.spawn(async move {
            let mut waiters = JoinSet::new();
            loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                if index >= scenario.tasks {
                    break;
                }

                let submitted_at = Instant::now();
                match pool.submit(scenario.work(index)).await {
                    Ok(handle) => {
                        let latency = Arc::clone(&latency);
                        let outcomes = Arc::clone(&outcomes);
                        let progress = progress.clone();
                        waiters.spawn(async move {
                            let result = handle.wait().await;
                            latency.record(submitted_at.elapsed());
                            outcomes.record(&result);
                            progress.inc(1);
                        });
                    }
                    Err(err) => {
                        tracing::debug!(index, error = %err, "Submission rejected");
                        outcomes.record_rejected();
                        progress.inc(1);
                        if matches!(err, PoolError::QueueClosed | PoolError::NotRunning) {
                            break;
                        }
                    }
                }
            }
            while waiters.join_next().await.is_some() {}
        });
    }

    while submitters.join_next().await.is_some() {}
}

fn report(pool: &WorkerPool, latency: &LatencyHistogram, outcomes: &Outcomes, elapsed: Duration) {
    let summary = latency.summary();
    let outcomes = outcomes.snapshot();
    let stats = pool.stats();
    let throughput = if elapsed.is_zero() {
        0.0
    } else {
        summary.count as f64 / elapsed.as_secs_f64()
    };

    println!();
    println!("=== taskpool load report ===");
    println!("elapsed:        {elapsed:.2?}");
    println!("throughput:     {throughput:.1} tasks/s");
    println!(
        "latency:        mean {:.2?}  p50 {:.2?}  p95 {:.2?}  p99 {:.2?}  max {:.2?}",
        summary.mean, summary.p50, summary.p95, summary.p99, summary.max
    );
    println!(
        "outcomes:       {} ok, {} failed, {} crashed, {} timed out, {} cancelled, {} rejected",
        outcomes.succeeded,
        outcomes.failed,
        outcomes.crashed,
        outcomes.timed_out,
        outcomes.cancelled,
        outcomes.rejected
    );
    println!(
        "pool:           {} retries, {} worker crashes, {} workers spawned",
        stats.counters.retries, stats.counters.worker_crashes, stats.counters.workers_spawned
    );

    tracing::info!(
        total = outcomes.total(),
        succeeded = outcomes.succeeded,
        retries = stats.counters.retries,
        p99_ms = summary.p99.as_millis() as u64,
        "Load run complete"
    );
}
