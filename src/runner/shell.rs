//! Shell-backed command runner.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::error::RunnerError;
use crate::runner::{CommandOutput, CommandRunner};

/// Runs commands through `<shell> -c` (or `cmd /C`).
///
/// Both streams are captured in full and then capped at `max_output_bytes`.
/// There is no timeout: a hung command holds its worker slot until the
/// watchdog gives up on the task.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    max_output_bytes: usize,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, max_output_bytes: usize) -> Self {
        Self {
            shell: shell.into(),
            max_output_bytes,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.shell.clone(), config.max_output_bytes)
    }

    fn command_flag(&self) -> &'static str {
        let name = std::path::Path::new(&self.shell)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if name.eq_ignore_ascii_case("cmd") {
            "/C"
        } else {
            "-c"
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, RunnerError> {
        let child = Command::new(&self.shell)
            .args([self.command_flag(), command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                shell: self.shell.clone(),
                reason: e.to_string(),
            })?;

        let output = child.wait_with_output().await?;

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(exit_code, stdout_bytes = output.stdout.len(), "Command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), self.max_output_bytes),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), self.max_output_bytes),
        })
    }
}

/// Keep the head and tail of oversized output (UTF-8 safe).
fn truncate_output(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let half = limit / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = ceil_char_boundary(s, s.len() - half);
    format!(
        "{}\n... [truncated {} bytes] ...\n{}",
        &s[..head_end],
        tail_start - head_end,
        &s[tail_start..]
    )
}

fn floor_char_boundary(s: &str, i: usize) -> usize {
    let mut pos = i.min(s.len());
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_char_boundary(s: &str, i: usize) -> usize {
    let mut pos = i.min(s.len());
    while pos < s.len() && !s.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}
