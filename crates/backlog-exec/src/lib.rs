//! backlog-exec — drives the local job-execution backend.
//!
//! A job graph is submitted over HTTP, progress arrives as frames on a
//! WebSocket opened under a per-process client id, and the artifacts
//! named in the finished execution's manifest are downloaded one by one.
//!
//! ```text
//! ExecClient
//!   ├── connect()            ws://<addr>/ws?clientId=<uuid>
//!   ├── submit(graph)        POST /prompt          → execution id
//!   ├── wait                 "executing" frames until node == null for our id
//!   ├── get_result(id)       GET /history/<id>     → manifest
//!   └── fetch_artifact(ref)  GET /view?filename=…  → bytes
//! ```
//!
//! Raw shell-command jobs bypass the backend and run through
//! [`CommandRunner`].

pub mod client;
pub mod command;
pub mod error;
pub mod events;
pub mod manifest;

pub use client::{Artifacts, ExecClient, ExecutionStatus, WorkflowExecution};
pub use command::{CommandOutput, CommandRunner};
pub use error::{ExecError, ExecResult};
pub use events::ProgressEvent;
pub use manifest::{ArtifactRef, HistoryEntry, HistoryStatus, NodeOutput};
