//! Periodic upkeep: keyring refresh and pruning, staging sweep, rate
//! limiter purge.
//!
//! Tasks run one after another, each on its own interval. A failing task is
//! logged and rescheduled; it never stops the others. The shutdown signal is
//! checked between tasks and interrupts the sleep between cycles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::keyring::KeyringCache;
use crate::rate_limit::RateLimiter;
use crate::shutdown::Shutdown;
use crate::staging::StagingArea;

#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

struct Scheduled {
    task: Box<dyn MaintenanceTask>,
    interval: Duration,
    /// Used instead of `interval` after a failed run.
    retry: Duration,
    next_due: Instant,
}

#[derive(Default)]
pub struct MaintenanceScheduler {
    tasks: Vec<Scheduled>,
}

impl MaintenanceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, first due immediately.
    pub fn register<T: MaintenanceTask + 'static>(self, task: T, interval: Duration) -> Self {
        self.register_with_retry(task, interval, interval)
    }

    /// Add a task that is rescheduled after `retry` rather than `interval`
    /// when a run fails.
    pub fn register_with_retry<T: MaintenanceTask + 'static>(
        mut self,
        task: T,
        interval: Duration,
        retry: Duration,
    ) -> Self {
        self.tasks.push(Scheduled {
            task: Box::new(task),
            interval,
            retry: retry.min(interval),
            next_due: Instant::now(),
        });
        self
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(tasks = self.tasks.len(), "Maintenance scheduler started");

        while !shutdown.is_triggered() {
            self.run_due(&shutdown).await;
            if shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(self.next_wakeup()) => {}
                _ = shutdown.triggered() => break,
            }
        }

        info!("Maintenance scheduler stopped");
    }

    /// Run every due task once, in registration order. Returns how many ran.
    pub async fn run_due(&mut self, shutdown: &Shutdown) -> usize {
        let mut ran = 0;
        for scheduled in &mut self.tasks {
            if shutdown.is_triggered() {
                break;
            }
            if scheduled.next_due > Instant::now() {
                continue;
            }

            let name = scheduled.task.name();
            let delay = match scheduled.task.run().await {
                Ok(()) => {
                    debug!(task = name, "Maintenance task done");
                    scheduled.interval
                }
                Err(e) => {
                    error!(
                        task = name,
                        error = %format!("{e:#}"),
                        retry_secs = scheduled.retry.as_secs(),
                        "Maintenance task failed"
                    );
                    scheduled.retry
                }
            };
            scheduled.next_due = Instant::now() + delay;
            ran += 1;
        }
        ran
    }

    fn next_wakeup(&self) -> Instant {
        self.tasks
            .iter()
            .map(|scheduled| scheduled.next_due)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(60))
    }
}

// ---------------------------------------------------------------------------
// Built-in tasks
// ---------------------------------------------------------------------------

pub struct KeyringRefresh(pub Arc<KeyringCache>);

#[async_trait]
impl MaintenanceTask for KeyringRefresh {
    fn name(&self) -> &'static str {
        "keyring-refresh"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.0.refresh().await?;
        Ok(())
    }
}

pub struct KeyringPrune(pub Arc<KeyringCache>);

#[async_trait]
impl MaintenanceTask for KeyringPrune {
    fn name(&self) -> &'static str {
        "keyring-prune"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let removed = self.0.prune(Utc::now()).await;
        if removed > 0 {
            info!(removed, remaining = self.0.len(), "Pruned keyring");
        }
        Ok(())
    }
}

pub struct StagingSweep {
    pub staging: StagingArea,
    pub max_age: Duration,
}

#[async_trait]
impl MaintenanceTask for StagingSweep {
    fn name(&self) -> &'static str {
        "staging-sweep"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.staging.sweep_stale(self.max_age).await?;
        Ok(())
    }
}

pub struct RateLimitPurge {
    pub limiter: RateLimiter,
    pub max_idle: Duration,
}

#[async_trait]
impl MaintenanceTask for RateLimitPurge {
    fn name(&self) -> &'static str {
        "rate-limit-purge"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let purged = self.limiter.purge_idle(self.max_idle);
        debug!(purged, tracked = self.limiter.tracked(), "Purged idle rate limit buckets");
        Ok(())
    }
}
