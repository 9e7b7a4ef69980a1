//! Task and execution data model.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default retry ceiling for new tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Scheduling status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Newly created, or queued for a retry.
    Pending,
    /// Last run succeeded.
    Active,
    /// Claimed; an execution is in flight.
    Running,
    /// Last run failed with no retries left, or the cron expression is invalid.
    Failed,
    /// Administratively suspended.
    Paused,
}

impl TaskStatus {
    /// Statuses considered for due-ness on each tick.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Paused => "PAUSED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACTIVE" => Ok(Self::Active),
            "RUNNING" => Ok(Self::Running),
            "FAILED" => Ok(Self::Failed),
            "PAUSED" => Ok(Self::Paused),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted schedulable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Five-field cron expression.
    pub cron: String,
    /// Opaque string handed to the shell.
    pub command: String,
    pub status: TaskStatus,
    /// Time of the most recent claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Manual override: run as soon as this instant has passed, regardless of cron.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    /// Reference point for the next cron evaluation: the last claim, or the
    /// creation time for a task that has never run.
    pub fn base_time(&self) -> DateTime<Utc> {
        self.last_run_at.unwrap_or(self.created_at)
    }

    /// Whether an unexpired force-run request has arrived.
    pub fn force_run_due(&self, now: DateTime<Utc>) -> bool {
        self.force_run_at.is_some_and(|at| at <= now)
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Definition of a task to be created.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub cron: String,
    pub command: String,
    pub max_retries: u32,
}

impl NewTask {
    pub fn new(
        name: impl Into<String>,
        cron: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            command: command.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Builder: set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Targeted update of a task's scheduling state.
///
/// `status` and `last_error` are left untouched when `None`. `force_run_at`
/// is written as given, so leaving it `None` clears any pending force-run
/// request.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub last_error: Option<String>,
    pub force_run_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Status of a single run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A single attempt to run a task's command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub task_id: i64,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Launch-level failure, distinct from a non-zero exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal outcome written back by a worker.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn task() -> Task {
        Task {
            id: 1,
            name: "backup".to_string(),
            cron: "*/5 * * * *".to_string(),
            command: "true".to_string(),
            status: TaskStatus::Pending,
            last_run_at: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            force_run_at: None,
            last_error: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[test]
    fn status_display_parse() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::Running,
            TaskStatus::Failed,
            TaskStatus::Paused,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn schedulable_set() {
        assert!(TaskStatus::Pending.is_schedulable());
        assert!(TaskStatus::Active.is_schedulable());
        assert!(TaskStatus::Failed.is_schedulable());
        assert!(!TaskStatus::Running.is_schedulable());
        assert!(!TaskStatus::Paused.is_schedulable());
    }

    #[test]
    fn execution_terminal_states() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
    }

    #[test]
    fn base_time_prefers_last_run() {
        let mut t = task();
        assert_eq!(t.base_time(), t.created_at);

        let later = t.created_at + Duration::minutes(7);
        t.last_run_at = Some(later);
        assert_eq!(t.base_time(), later);
    }

    #[test]
    fn force_run_due_only_when_past() {
        let mut t = task();
        let now = t.created_at + Duration::minutes(1);
        assert!(!t.force_run_due(now));

        t.force_run_at = Some(now + Duration::seconds(1));
        assert!(!t.force_run_due(now));

        t.force_run_at = Some(now);
        assert!(t.force_run_due(now));
    }

    #[test]
    fn serializes_status_uppercase() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("last_run_at").is_none());
    }
}
