//! libSQL backend for the task and execution stores.
//!
//! Holds a single connection that is reused for every operation, so all
//! writes against one database file are serialized through it. Supports
//! local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ExecutionStore, TaskStore};
use crate::tasks::{
    Execution, ExecutionOutcome, ExecutionStatus, NewTask, Task, TaskStatus, TaskUpdate,
};

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn task_exists(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("task_exists: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("task_exists: {e}")))?;
        Ok(row.is_some())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse an RFC 3339, SQLite or naive ISO-8601 datetime string.
///
/// Naive values are taken to be UTC.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Ok(ndt.and_utc());
        }
    }
    Err(DatabaseError::Serialization(format!(
        "unrecognised timestamp '{s}'"
    )))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_timestamp(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn int_col(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn text_col(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn counter(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

const TASK_COLUMNS: &str = "id, name, cron, command, status, last_run_at, created_at, force_run_at, last_error, retry_count, max_retries";

const EXECUTION_COLUMNS: &str =
    "id, task_id, status, started_at, finished_at, stdout, stderr, error";

/// Map a libsql Row to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let status = text_col(row, 4)?;
    let created_at = text_col(row, 6)?;

    Ok(Task {
        id: int_col(row, 0)?,
        name: text_col(row, 1)?,
        cron: text_col(row, 2)?,
        command: text_col(row, 3)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        last_run_at: parse_optional_datetime(row.get(5).ok())?,
        created_at: parse_datetime(&created_at)?,
        force_run_at: parse_optional_datetime(row.get(7).ok())?,
        last_error: row.get(8).ok(),
        retry_count: counter(int_col(row, 9)?),
        max_retries: counter(int_col(row, 10)?),
    })
}

/// Map a libsql Row to an Execution.
fn row_to_execution(row: &libsql::Row) -> Result<Execution, DatabaseError> {
    let status = text_col(row, 2)?;
    let started_at = text_col(row, 3)?;

    Ok(Execution {
        id: int_col(row, 0)?,
        task_id: int_col(row, 1)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        started_at: parse_datetime(&started_at)?,
        finished_at: parse_optional_datetime(row.get(4).ok())?,
        stdout: row.get(5).ok(),
        stderr: row.get(6).ok(),
        error: row.get(7).ok(),
    })
}

// ── Task store ──────────────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn create_task(&self, task: &NewTask) -> Result<Task, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO tasks (name, cron, command, status, created_at, max_retries)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     RETURNING {TASK_COLUMNS}"
                ),
                params![
                    task.name.as_str(),
                    task.cron.as_str(),
                    task.command.as_str(),
                    TaskStatus::Pending.as_str(),
                    ts(Utc::now()),
                    i64::from(task.max_retries)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?
            .ok_or_else(|| DatabaseError::Query("create_task: no row returned".to_string()))?;

        let created = row_to_task(&row)?;
        debug!(task_id = created.id, name = %created.name, "Task created");
        Ok(created)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?
        {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn get_task(&self, id: i64) -> Result<Task, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row),
            Ok(None) => Err(DatabaseError::task_not_found(id)),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn try_claim(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        // Compare-and-set: only one writer can move the row out of the
        // schedulable set, every other caller sees zero affected rows.
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'RUNNING', last_run_at = ?1
                 WHERE id = ?2 AND status IN ('PENDING', 'ACTIVE', 'FAILED')",
                params![ts(now), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_claim: {e}")))?;

        Ok(count == 1)
    }

    async fn update_fields(&self, id: i64, update: TaskUpdate) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET
                    status = COALESCE(?1, status),
                    last_error = COALESCE(?2, last_error),
                    force_run_at = ?3
                 WHERE id = ?4",
                params![
                    opt_text(update.status.as_ref().map(TaskStatus::as_str)),
                    opt_text(update.last_error.as_deref()),
                    opt_timestamp(update.force_run_at),
                    id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_fields: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::task_not_found(id));
        }
        Ok(())
    }

    async fn increment_retry(&self, id: i64) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?1 RETURNING retry_count",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_retry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(counter(int_col(&row, 0)?)),
            Ok(None) => Err(DatabaseError::task_not_found(id)),
            Err(e) => Err(DatabaseError::Query(format!("increment_retry: {e}"))),
        }
    }

    async fn reset_retry(&self, id: i64) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute("UPDATE tasks SET retry_count = 0 WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_retry: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::task_not_found(id));
        }
        Ok(())
    }

    async fn request_force_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET force_run_at = ?1 WHERE id = ?2",
                params![ts(at), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("request_force_run: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::task_not_found(id));
        }
        info!(task_id = id, at = %at, "Force run requested");
        Ok(())
    }

    async fn set_paused(&self, id: i64, paused: bool) -> Result<bool, DatabaseError> {
        let (sql, op) = if paused {
            (
                "UPDATE tasks SET status = 'PAUSED' WHERE id = ?1 AND status != 'RUNNING'",
                "pause",
            )
        } else {
            (
                "UPDATE tasks SET status = 'PENDING' WHERE id = ?1 AND status = 'PAUSED'",
                "resume",
            )
        };

        let count = self
            .conn()
            .execute(sql, params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        if count == 0 && !self.task_exists(id).await? {
            return Err(DatabaseError::task_not_found(id));
        }
        Ok(count == 1)
    }

    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        // Foreign keys are off by default in SQLite, so the cascade is manual.
        conn.execute("DELETE FROM executions WHERE task_id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task executions: {e}")))?;

        let count = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;

        if count > 0 {
            info!(task_id = id, "Task deleted");
        }
        Ok(count > 0)
    }
}

// ── Execution store ─────────────────────────────────────────────────

#[async_trait]
impl ExecutionStore for LibSqlBackend {
    async fn create_execution(
        &self,
        task_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO executions (task_id, status, started_at) VALUES (?1, ?2, ?3) RETURNING id",
                params![task_id, ExecutionStatus::Queued.as_str(), ts(started_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_execution: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_execution: {e}")))?
            .ok_or_else(|| {
                DatabaseError::Query("create_execution: no row returned".to_string())
            })?;
        int_col(&row, 0)
    }

    async fn mark_execution_running(&self, id: i64) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE executions SET status = 'RUNNING' WHERE id = ?1 AND status = 'QUEUED'",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_execution_running: {e}")))?;

        if count == 0 {
            // Either unknown, or already past QUEUED; the latter is left as is.
            self.get_execution(id).await?;
        }
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: i64,
        outcome: &ExecutionOutcome,
    ) -> Result<(), DatabaseError> {
        if !outcome.status.is_terminal() {
            return Err(DatabaseError::Query(format!(
                "finish_execution: {} is not a terminal status",
                outcome.status
            )));
        }

        let count = self
            .conn()
            .execute(
                "UPDATE executions
                 SET status = ?1, finished_at = ?2, stdout = ?3, stderr = ?4, error = ?5
                 WHERE id = ?6 AND status IN ('QUEUED', 'RUNNING')",
                params![
                    outcome.status.as_str(),
                    ts(outcome.finished_at),
                    opt_text(outcome.stdout.as_deref()),
                    opt_text(outcome.stderr.as_deref()),
                    opt_text(outcome.error.as_deref()),
                    id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_execution: {e}")))?;

        if count == 0 {
            let existing = self.get_execution(id).await?;
            debug!(
                execution_id = id,
                status = %existing.status,
                "Execution already terminal, outcome ignored"
            );
        }
        Ok(())
    }

    async fn get_execution(&self, id: i64) -> Result<Execution, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_execution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_execution(&row),
            Ok(None) => Err(DatabaseError::execution_not_found(id)),
            Err(e) => Err(DatabaseError::Query(format!("get_execution: {e}"))),
        }
    }

    async fn list_executions_for_task(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<Execution>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions
                     WHERE task_id = ?1
                     ORDER BY started_at DESC, id DESC
                     LIMIT ?2"
                ),
                params![task_id, limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions_for_task: {e}")))?;

        let mut executions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions_for_task: {e}")))?
        {
            match row_to_execution(&row) {
                Ok(execution) => executions.push(execution),
                Err(e) => tracing::warn!("Skipping execution row: {e}"),
            }
        }
        Ok(executions)
    }
}
