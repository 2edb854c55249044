//! Shell command jobs.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info};

use crate::error::{ExecError, ExecResult};

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs commands through `sh -c` on the host.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: String,
    timeout: Option<Duration>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: None,
        }
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the command if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `command` and wait for it. A non-zero exit is an error.
    pub async fn run(&self, command: &str) -> ExecResult<CommandOutput> {
        info!(command, "running command");

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match self.timeout {
            None => child.wait_with_output().await?,
            Some(after) => match tokio::time::timeout(after, child.wait_with_output()).await {
                Ok(out) => out?,
                // Dropping the future kills the child.
                Err(_) => {
                    error!(command, ?after, "command timed out");
                    return Err(ExecError::Timeout { after });
                }
            },
        };

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if output.status.success() {
            info!(exit_code = ?result.exit_code, stdout_bytes = result.stdout.len(), "command completed");
            Ok(result)
        } else {
            error!(exit_code = ?result.exit_code, stderr = %result.stderr.trim(), "command failed");
            Err(ExecError::CommandFailed {
                exit_code: result.exit_code,
                stderr: if result.stderr.is_empty() {
                    format!("exit code {:?}", result.exit_code)
                } else {
                    result.stderr
                },
            })
        }
    }
}
