//! Progress frames pushed by the backend.

use serde::Deserialize;
use serde_json::Value;

/// A decoded text frame from the progress channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Execution moved to `node`; `None` means no node is left to run.
    Executing {
        node: Option<String>,
        execution_id: Option<String>,
    },
    /// The backend aborted an execution.
    ExecutionError {
        execution_id: Option<String>,
        node: Option<String>,
        message: String,
    },
    /// The execution was stopped before it finished, e.g. by a user
    /// cancelling it on the backend.
    ExecutionInterrupted {
        execution_id: Option<String>,
        node: Option<String>,
    },
    /// Status, progress and other frames the client does not act on.
    Other(String),
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl ProgressEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawEvent = serde_json::from_str(text)?;
        let field = |key: &str| -> Option<String> {
            match raw.data.get(key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }
        };

        Ok(match raw.kind.as_str() {
            "executing" => ProgressEvent::Executing {
                node: field("node"),
                execution_id: field("prompt_id"),
            },
            "execution_error" => ProgressEvent::ExecutionError {
                execution_id: field("prompt_id"),
                node: field("node_id"),
                message: field("exception_message").unwrap_or_else(|| "unknown error".to_string()),
            },
            "execution_interrupted" => ProgressEvent::ExecutionInterrupted {
                execution_id: field("prompt_id"),
                node: field("node_id"),
            },
            _ => ProgressEvent::Other(raw.kind),
        })
    }

    /// Whether this frame marks `execution_id` as finished.
    pub fn completes(&self, execution_id: &str) -> bool {
        matches!(
            self,
            ProgressEvent::Executing { node: None, execution_id: Some(id) } if id == execution_id
        )
    }
}
