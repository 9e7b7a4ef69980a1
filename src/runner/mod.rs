//! Command execution.
//!
//! The worker only sees the [`CommandRunner`] trait; [`ShellRunner`] is the
//! production implementation.

pub mod shell;

use async_trait::async_trait;

use crate::error::RunnerError;

pub use shell::ShellRunner;

/// What a finished command left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs an opaque command string to completion.
///
/// An `Err` means the command could not be launched at all. A command that
/// ran and exited non-zero is an `Ok` with that exit code.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, RunnerError>;
}
