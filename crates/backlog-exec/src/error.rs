//! Execution client errors.

use std::time::Duration;

use backlog_http::HttpError;
use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    /// Nothing is accepting connections at the backend address yet.
    #[error("execution backend not ready at {address}: {reason}")]
    NotReady { address: String, reason: String },

    /// The progress channel could not be opened for another reason.
    #[error("failed to open progress channel: {0}")]
    Connect(String),

    #[error("progress channel is not connected")]
    NotConnected,

    /// The progress channel dropped while a job was running.
    #[error("progress channel dropped mid-run: {0}")]
    Disconnected(String),

    /// The backend refused the job.
    #[error("backend rejected job ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The backend reported an error while executing.
    #[error("execution {execution_id} failed: {message}")]
    ExecutionFailed {
        execution_id: String,
        message: String,
    },

    #[error("job exceeded its {after:?} deadline")]
    Timeout { after: Duration },

    #[error("backend request failed: {0}")]
    Http(#[from] HttpError),

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl ExecError {
    /// Whether the error means the progress channel must be reopened
    /// before the next job.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            ExecError::Disconnected(_) | ExecError::NotConnected | ExecError::Timeout { .. }
        )
    }
}
