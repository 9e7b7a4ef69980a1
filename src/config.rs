//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// What the watchdog does with a task stuck in RUNNING past the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Mark the task FAILED without touching its retry counter.
    #[default]
    Fail,
    /// Treat the timeout like any other execution failure and go through
    /// the bounded retry path.
    Retry,
}

impl FromStr for StalePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(StalePolicy::Fail),
            "retry" => Ok(StalePolicy::Retry),
            other => Err(format!("unknown stale policy: {other} (expected 'fail' or 'retry')")),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// How often the scheduler loop wakes up.
    pub poll_interval: Duration,
    /// A RUNNING task whose claim is older than this is reclaimed by the watchdog.
    pub running_timeout: Duration,
    /// Size of the worker pool.
    pub max_concurrent_runs: usize,
    /// Watchdog behaviour for stale RUNNING tasks.
    pub stale_policy: StalePolicy,
    /// Cap on each captured output stream.
    pub max_output_bytes: usize,
    /// Shell used to interpret task commands.
    pub shell: String,
    /// Directory for the rolling log file.
    pub log_dir: PathBuf,
    /// How long `run` waits for in-flight workers on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/scheduler.db"),
            poll_interval: Duration::from_secs(5),
            running_timeout: Duration::from_secs(60),
            max_concurrent_runs: 16,
            stale_policy: StalePolicy::Fail,
            max_output_bytes: 64 * 1024,
            shell: default_shell().to_string(),
            log_dir: PathBuf::from("./logs"),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

fn default_shell() -> &'static str {
    if cfg!(target_os = "windows") { "cmd" } else { "sh" }
}

impl SchedulerConfig {
    /// Build the configuration from `CRON_SCHEDULER_*` environment variables,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("CRON_SCHEDULER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let poll_interval_secs: u64 = parse_var(
            &lookup,
            "CRON_SCHEDULER_POLL_INTERVAL_SECS",
            defaults.poll_interval.as_secs(),
        )?;
        if poll_interval_secs == 0 {
            return Err(invalid("CRON_SCHEDULER_POLL_INTERVAL_SECS", "must be at least 1"));
        }

        let running_timeout_secs: u64 = parse_var(
            &lookup,
            "CRON_SCHEDULER_RUNNING_TIMEOUT_SECS",
            defaults.running_timeout.as_secs(),
        )?;
        if running_timeout_secs == 0 {
            return Err(invalid("CRON_SCHEDULER_RUNNING_TIMEOUT_SECS", "must be at least 1"));
        }

        let max_concurrent_runs: usize = parse_var(
            &lookup,
            "CRON_SCHEDULER_MAX_CONCURRENT_RUNS",
            defaults.max_concurrent_runs,
        )?;
        if max_concurrent_runs == 0 {
            return Err(invalid("CRON_SCHEDULER_MAX_CONCURRENT_RUNS", "must be at least 1"));
        }

        let stale_policy: StalePolicy =
            parse_var(&lookup, "CRON_SCHEDULER_STALE_POLICY", defaults.stale_policy)?;

        let max_output_bytes: usize = parse_var(
            &lookup,
            "CRON_SCHEDULER_MAX_OUTPUT_BYTES",
            defaults.max_output_bytes,
        )?;

        let shell = lookup("CRON_SCHEDULER_SHELL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.shell);

        let log_dir = lookup("CRON_SCHEDULER_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);

        let shutdown_grace_secs: u64 = parse_var(
            &lookup,
            "CRON_SCHEDULER_SHUTDOWN_GRACE_SECS",
            defaults.shutdown_grace.as_secs(),
        )?;

        Ok(Self {
            db_path,
            poll_interval: Duration::from_secs(poll_interval_secs),
            running_timeout: Duration::from_secs(running_timeout_secs),
            max_concurrent_runs,
            stale_policy,
            max_output_bytes,
            shell,
            log_dir,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
