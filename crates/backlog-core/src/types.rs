//! Job and queue-message types shared across backlogd crates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Reserved body key that marks a raw shell command job.
pub const COMMAND_KEY: &str = "exec_cmd";

/// A message received from the work queue.
///
/// `receipt` is the queue-issued acknowledgment token. It is only valid
/// for the receive that produced it and is required to delete the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub receipt: String,
    /// How many times the queue has handed this message out, including
    /// this delivery. Values above 1 mean an earlier attempt did not
    /// acknowledge it.
    pub receive_count: u32,
}

impl QueueMessage {
    /// Parse the body into a [`Job`].
    pub fn job(&self) -> Result<Job, JobParseError> {
        Job::parse(&self.body)
    }

    /// Whether this delivery is a redelivery of an unacknowledged message.
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }
}

/// A unit of work carried by a queue message.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// Run a shell command on the host.
    Command { exec_cmd: String },
    /// Submit a job graph to the execution backend.
    Graph(Map<String, Value>),
}

impl Job {
    /// Decode a message body.
    ///
    /// The wire format is a JSON object. An object carrying the reserved
    /// `exec_cmd` key is a command job; any other object is a job graph.
    pub fn parse(body: &str) -> Result<Self, JobParseError> {
        let value: Value = serde_json::from_str(body)?;
        let Value::Object(mut map) = value else {
            return Err(JobParseError::NotAnObject);
        };

        match map.remove(COMMAND_KEY) {
            None => {
                if map.is_empty() {
                    return Err(JobParseError::EmptyGraph);
                }
                Ok(Job::Graph(map))
            }
            Some(Value::String(cmd)) if !cmd.trim().is_empty() => {
                Ok(Job::Command { exec_cmd: cmd })
            }
            Some(_) => Err(JobParseError::InvalidCommand),
        }
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Command { .. } => "command",
            Job::Graph(_) => "graph",
        }
    }

    /// Encode back into the wire format producers use.
    pub fn to_body(&self) -> String {
        match self {
            Job::Command { exec_cmd } => {
                serde_json::json!({ COMMAND_KEY: exec_cmd }).to_string()
            }
            Job::Graph(map) => Value::Object(map.clone()).to_string(),
        }
    }
}

/// Reasons a message body cannot be turned into a [`Job`].
#[derive(Debug, Error)]
pub enum JobParseError {
    #[error("body is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body is not a json object")]
    NotAnObject,

    #[error("`exec_cmd` must be a non-empty string")]
    InvalidCommand,

    #[error("job graph has no nodes")]
    EmptyGraph,
}
