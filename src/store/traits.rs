//! Store traits: the persistence seams the scheduler is written against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::tasks::{Execution, ExecutionOutcome, NewTask, Task, TaskUpdate};

/// Persisted catalogue of task definitions and their scheduling state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task with status PENDING.
    async fn create_task(&self, task: &NewTask) -> Result<Task, DatabaseError>;

    /// Full snapshot of every task.
    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Point read. Fails with `NotFound` for an unknown id.
    async fn get_task(&self, id: i64) -> Result<Task, DatabaseError>;

    /// Atomically move a schedulable task to RUNNING and stamp `last_run_at`.
    ///
    /// Returns `true` only for the caller whose write performed the
    /// transition. A `false` result leaves the row untouched.
    async fn try_claim(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Partial update of the scheduling state. See [`TaskUpdate`] for which
    /// fields are optional.
    async fn update_fields(&self, id: i64, update: TaskUpdate) -> Result<(), DatabaseError>;

    /// Bump the retry counter and return the new value.
    async fn increment_retry(&self, id: i64) -> Result<u32, DatabaseError>;

    /// Reset the retry counter to zero.
    async fn reset_retry(&self, id: i64) -> Result<(), DatabaseError>;

    // ── Administrative surface ──────────────────────────────────────

    /// Ask for the task to run as soon as `at` has passed.
    async fn request_force_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Pause (PAUSED) or resume (PENDING) a task. A RUNNING task is left
    /// alone and `false` is returned.
    async fn set_paused(&self, id: i64, paused: bool) -> Result<bool, DatabaseError>;

    /// Delete a task and its execution history. Returns whether a row was removed.
    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError>;
}

/// Log of individual run attempts.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Record a new QUEUED execution and return its id.
    async fn create_execution(
        &self,
        task_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    /// Transition a QUEUED execution to RUNNING.
    async fn mark_execution_running(&self, id: i64) -> Result<(), DatabaseError>;

    /// Write the terminal outcome of an execution.
    async fn finish_execution(
        &self,
        id: i64,
        outcome: &ExecutionOutcome,
    ) -> Result<(), DatabaseError>;

    /// Point read. Fails with `NotFound` for an unknown id.
    async fn get_execution(&self, id: i64) -> Result<Execution, DatabaseError>;

    /// Executions of one task, most recent first.
    async fn list_executions_for_task(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<Execution>, DatabaseError>;
}

/// A backend that serves both stores.
pub trait Database: TaskStore + ExecutionStore {}

impl<T: TaskStore + ExecutionStore + ?Sized> Database for T {}
