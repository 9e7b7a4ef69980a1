//! Scheduler loop.
//!
//! Every tick takes a snapshot of the task catalogue and, per task:
//! - reclaims it if it has sat in RUNNING past the timeout (watchdog),
//! - marks it FAILED if its cron expression does not parse,
//! - otherwise claims and dispatches it when it is due.
//!
//! Dispatch is bounded by a semaphore. A permit is taken before the claim,
//! so a saturated pool leaves the task untouched for the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{SchedulerConfig, StalePolicy};
use crate::runner::CommandRunner;
use crate::scheduler::cron;
use crate::scheduler::worker::{self, WorkerContext};
use crate::store::Database;
use crate::tasks::{Task, TaskStatus, TaskUpdate};

/// What a single tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    /// Stale RUNNING tasks handed to the watchdog.
    pub recovered: usize,
    /// Tasks moved to FAILED because their cron expression is invalid.
    pub invalid: usize,
    /// Tasks claimed and dispatched.
    pub claimed: usize,
    /// Due tasks left for the next tick because the pool was full.
    pub deferred: usize,
    /// Handles of the workers dispatched by this tick.
    pub workers: Vec<JoinHandle<()>>,
}

impl TickSummary {
    /// Wait for every worker dispatched by this tick.
    pub async fn join_workers(self) {
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!("Worker task panicked: {e}");
            }
        }
    }
}

/// The scheduling engine.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    store: Arc<dyn Database>,
    runner: Arc<dyn CommandRunner>,
    slots: Arc<Semaphore>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Database>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Self {
            config,
            store,
            runner,
            slots,
        }
    }

    /// Number of idle worker slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run one tick at the current time.
    pub async fn tick(&self) -> crate::error::Result<TickSummary> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as if the clock read `now`.
    ///
    /// Only the initial snapshot can fail the tick; errors on individual
    /// tasks are logged and skip that task.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> crate::error::Result<TickSummary> {
        let tasks = self.store.list_tasks().await?;
        let mut summary = TickSummary::default();

        for task in tasks {
            if task.status == TaskStatus::Running {
                if self.is_stale(&task, now) {
                    self.reclaim_stale(&task, now).await;
                    summary.recovered += 1;
                }
                continue;
            }
            if !task.status.is_schedulable() {
                continue;
            }

            let next = match cron::next_due(&task.cron, task.base_time()) {
                Ok(next) => next,
                Err(e) => {
                    self.mark_invalid(&task, &e.to_string()).await;
                    summary.invalid += 1;
                    continue;
                }
            };

            if next > now && !task.force_run_due(now) {
                continue;
            }

            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!(task_id = task.id, "Worker pool full, deferring task");
                summary.deferred += 1;
                continue;
            };

            if let Some(handle) = self.claim_and_dispatch(task, now, permit).await {
                summary.claimed += 1;
                summary.workers.push(handle);
            }
        }

        if summary.claimed + summary.recovered + summary.invalid + summary.deferred > 0 {
            debug!(
                claimed = summary.claimed,
                recovered = summary.recovered,
                invalid = summary.invalid,
                deferred = summary.deferred,
                "Tick complete"
            );
        }
        Ok(summary)
    }

    /// Tick on the configured interval until `shutdown` flips to `true`.
    ///
    /// In-flight workers are not cancelled; see [`drain`](Self::drain).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent_runs = self.config.max_concurrent_runs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Wait until every worker slot is free again, or `grace` elapses.
    /// Returns whether the pool drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let total = u32::try_from(self.config.max_concurrent_runs).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.slots.acquire_many(total)).await {
            Ok(Ok(_all)) => true,
            Ok(Err(_closed)) => true,
            Err(_) => {
                warn!(
                    in_flight = self.config.max_concurrent_runs - self.available_slots(),
                    "Shutdown grace period elapsed with workers still running"
                );
                false
            }
        }
    }

    fn is_stale(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let claimed_at = task.base_time();
        match (now - claimed_at).to_std() {
            Ok(elapsed) => elapsed > self.config.running_timeout,
            Err(_) => false,
        }
    }

    async fn reclaim_stale(&self, task: &Task, now: DateTime<Utc>) {
        let elapsed = (now - task.base_time()).num_seconds();
        let message = format!(
            "execution timed out: RUNNING for {elapsed}s without reporting completion (timeout {}s)",
            self.config.running_timeout.as_secs()
        );

        let result = match self.config.stale_policy {
            StalePolicy::Fail => self
                .store
                .update_fields(task.id, TaskUpdate::status(TaskStatus::Failed).with_error(&message))
                .await
                .map(|_| TaskStatus::Failed),
            StalePolicy::Retry => worker::record_failure(self.store.as_ref(), task, &message).await,
        };

        match result {
            Ok(status) => warn!(
                task_id = task.id,
                name = %task.name,
                elapsed_secs = elapsed,
                new_status = %status,
                "Reclaimed stale task"
            ),
            Err(e) => error!(task_id = task.id, "Failed to reclaim stale task: {e}"),
        }
    }

    async fn mark_invalid(&self, task: &Task, message: &str) {
        warn!(task_id = task.id, cron = %task.cron, "Invalid cron expression: {message}");
        if let Err(e) = self
            .store
            .update_fields(task.id, TaskUpdate::status(TaskStatus::Failed).with_error(message))
            .await
        {
            error!(task_id = task.id, "Failed to mark task invalid: {e}");
        }
    }

    /// Claim a due task and spawn its worker. The permit travels with the
    /// worker and is released when it finishes.
    async fn claim_and_dispatch(
        &self,
        task: Task,
        now: DateTime<Utc>,
        permit: OwnedSemaphorePermit,
    ) -> Option<JoinHandle<()>> {
        match self.store.try_claim(task.id, now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = task.id, "Claim lost to another scheduler");
                return None;
            }
            Err(e) => {
                error!(task_id = task.id, "Claim failed: {e}");
                return None;
            }
        }

        // A claimed task without an execution record has no worker; the
        // watchdog reclaims it once the timeout passes.
        let execution_id = match self.store.create_execution(task.id, now).await {
            Ok(id) => id,
            Err(e) => {
                error!(task_id = task.id, "Failed to create execution record: {e}");
                return None;
            }
        };

        debug!(task_id = task.id, execution_id, "Task claimed");

        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            runner: Arc::clone(&self.runner),
        };
        Some(tokio::spawn(async move {
            worker::execute_task(ctx, task, execution_id).await;
            drop(permit);
        }))
    }
}
