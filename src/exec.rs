//! Subprocess execution behind a mockable seam.
//!
//! Everything the daemon runs on the host (`mount`, `systemctl reboot`,
//! the OS update tool, one-shot journal scans) goes through
//! [`CommandRunner`], so hermetic tests never touch the host.

use std::process::{Command, Output};

use tracing::debug;

use crate::error::Error;

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether the command exited successfully
    pub success: bool,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

impl CommandOutput {
    /// Convert a failed exit into a host error naming the operation.
    pub fn require_success(self, what: &str) -> Result<CommandOutput, Error> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::host(format!(
                "{what} failed: {}",
                self.stderr.trim()
            )))
        }
    }
}

/// Trait for executing external commands (allows mocking in tests)
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing output.
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error>;
}

/// Real command runner that executes actual system commands
#[derive(Default, Clone)]
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error> {
        debug!(program, ?args, "executing command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::host(format!("failed to execute {program}: {e}")))?;
        Ok(output.into())
    }
}
