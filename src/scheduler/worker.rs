//! Execution worker: runs one claimed task to completion and writes the
//! outcome back to both stores.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::DatabaseError;
use crate::runner::{CommandOutput, CommandRunner};
use crate::store::Database;
use crate::tasks::{ExecutionOutcome, ExecutionStatus, Task, TaskStatus, TaskUpdate};

/// Longest stderr excerpt copied into `last_error`.
const ERROR_EXCERPT_LEN: usize = 500;

/// Shared context handed to each spawned worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn Database>,
    pub runner: Arc<dyn CommandRunner>,
}

/// Run a claimed task. Never returns an error: every store failure is logged
/// and the watchdog is left to recover whatever state could not be written.
pub(crate) async fn execute_task(ctx: WorkerContext, task: Task, execution_id: i64) {
    if let Err(e) = ctx.store.mark_execution_running(execution_id).await {
        warn!(task_id = task.id, execution_id, "Failed to mark execution running: {e}");
    }

    info!(task_id = task.id, execution_id, name = %task.name, "Running task");

    let result = ctx.runner.run(&task.command).await;
    let finished_at = Utc::now();

    let (outcome, failure) = match result {
        Ok(output) if output.success() => (
            ExecutionOutcome {
                status: ExecutionStatus::Success,
                finished_at,
                stdout: Some(output.stdout),
                stderr: Some(output.stderr),
                error: None,
            },
            None,
        ),
        Ok(output) => {
            let message = exit_diagnostic(&output);
            (
                ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    finished_at,
                    stdout: Some(output.stdout),
                    stderr: Some(output.stderr),
                    error: None,
                },
                Some(message),
            )
        }
        Err(e) => {
            let message = e.to_string();
            (
                ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    finished_at,
                    stdout: None,
                    stderr: None,
                    error: Some(message.clone()),
                },
                Some(message),
            )
        }
    };

    if let Err(e) = ctx.store.finish_execution(execution_id, &outcome).await {
        error!(task_id = task.id, execution_id, "Failed to record execution outcome: {e}");
    }

    let written = match failure {
        None => record_success(ctx.store.as_ref(), task.id).await,
        Some(message) => {
            warn!(task_id = task.id, execution_id, error = %message, "Task run failed");
            record_failure(ctx.store.as_ref(), &task, &message)
                .await
                .map(|_| ())
        }
    };

    if let Err(e) = written {
        error!(task_id = task.id, execution_id, "Failed to update task state: {e}");
    }
}

async fn record_success(store: &dyn Database, task_id: i64) -> Result<(), DatabaseError> {
    store.reset_retry(task_id).await?;
    store
        .update_fields(task_id, TaskUpdate::status(TaskStatus::Active))
        .await?;
    info!(task_id, "Task run succeeded");
    Ok(())
}

/// Apply the bounded retry policy after a failed run and return the status
/// the task was moved to.
///
/// Reads the task again so the decision uses the stored counters rather than
/// the loop's snapshot. Falls back to the snapshot if that read fails.
pub(crate) async fn record_failure(
    store: &dyn Database,
    snapshot: &Task,
    message: &str,
) -> Result<TaskStatus, DatabaseError> {
    let current = match store.get_task(snapshot.id).await {
        Ok(task) => task,
        Err(e) => {
            warn!(task_id = snapshot.id, "Re-reading task failed, using snapshot: {e}");
            snapshot.clone()
        }
    };

    let status = if current.retries_remaining() {
        let attempt = store.increment_retry(current.id).await?;
        info!(
            task_id = current.id,
            attempt,
            max_retries = current.max_retries,
            "Task queued for retry"
        );
        TaskStatus::Pending
    } else {
        warn!(
            task_id = current.id,
            max_retries = current.max_retries,
            "Retries exhausted, task failed"
        );
        TaskStatus::Failed
    };

    store
        .update_fields(current.id, TaskUpdate::status(status).with_error(message))
        .await?;
    Ok(status)
}

fn exit_diagnostic(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("command exited with status {}", output.exit_code)
    } else {
        format!(
            "command exited with status {}: {}",
            output.exit_code,
            excerpt(stderr, ERROR_EXCERPT_LEN)
        )
    }
}

fn excerpt(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
