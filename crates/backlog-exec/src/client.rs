//! Execution backend client.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backlog_http::{HttpClient, HttpRequest};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{ExecError, ExecResult};
use crate::events::ProgressEvent;
use crate::manifest::{ArtifactRef, HistoryEntry};

type ProgressChannel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Downloaded artifacts keyed by producing node.
pub type Artifacts = BTreeMap<String, Vec<Bytes>>;

/// Lifecycle of a submitted job graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Submitted,
    Executing,
    Completed,
    Failed,
}

/// Tracking record for one submitted graph.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub client_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Node currently running, as last reported.
    pub current_node: Option<String>,
    pub output_refs: Vec<ArtifactRef>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    prompt_id: String,
}

/// Client for the local execution backend.
///
/// Holds one progress channel and is used by a single worker loop at a
/// time; correlation by execution id only tells apart *which* job
/// finished, not concurrent waits.
pub struct ExecClient {
    address: String,
    client_id: String,
    http: HttpClient,
    channel: Option<ProgressChannel>,
    output_dir: Option<PathBuf>,
}

impl ExecClient {
    /// `address` is the backend's `host:port`.
    pub fn new(address: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            http: HttpClient::plain(request_timeout),
            channel: None,
            output_dir: None,
        }
    }

    /// Also write every fetched artifact under `dir/<execution_id>/`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Open the progress channel under this process's client id.
    pub async fn connect(&mut self) -> ExecResult<()> {
        let url = format!("ws://{}/ws?clientId={}", self.address, self.client_id);
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _resp)) => {
                info!(address = %self.address, client_id = %self.client_id, "progress channel connected");
                self.channel = Some(stream);
                Ok(())
            }
            Err(e) => Err(classify_connect_error(&self.address, e)),
        }
    }

    /// Drop the current channel (if any) and open a new one. The client id
    /// is kept, so the backend keeps routing our events to us.
    pub async fn reconnect(&mut self) -> ExecResult<()> {
        self.disconnect().await;
        self.connect().await
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.close(None).await;
            debug!(client_id = %self.client_id, "progress channel closed");
        }
    }

    /// Enqueue `graph` on the backend.
    pub async fn submit(&self, graph: &Map<String, Value>) -> ExecResult<WorkflowExecution> {
        let body = serde_json::json!({ "prompt": graph, "client_id": self.client_id });
        let req = HttpRequest::post(&self.url("/prompt"))?.json(&body)?;
        let resp = self.http.send(req).await?;
        if !resp.is_success() {
            return Err(ExecError::Rejected {
                status: resp.status.as_u16(),
                body: resp.text(),
            });
        }

        let submitted: SubmitResponse = resp
            .json()
            .map_err(|e| ExecError::Protocol(format!("submit response: {e}")))?;
        debug!(execution_id = %submitted.prompt_id, nodes = graph.len(), "job graph submitted");

        Ok(WorkflowExecution {
            client_id: self.client_id.clone(),
            execution_id: submitted.prompt_id,
            status: ExecutionStatus::Submitted,
            current_node: None,
            output_refs: Vec::new(),
        })
    }

    /// Fetch the result manifest of a finished execution.
    pub async fn get_result(&self, execution_id: &str) -> ExecResult<HistoryEntry> {
        let resp = self.http.get(&self.url(&format!("/history/{execution_id}"))).await?;
        if !resp.is_success() {
            return Err(ExecError::Protocol(format!(
                "history for {execution_id} returned {}",
                resp.status
            )));
        }
        let doc: Value = resp.json()?;
        let entry = HistoryEntry::from_history(&doc, execution_id)
            .map_err(|e| ExecError::Protocol(format!("history for {execution_id}: {e}")))?
            .ok_or_else(|| ExecError::Protocol(format!("no history recorded for {execution_id}")))?;
        if entry.is_error() {
            return Err(ExecError::ExecutionFailed {
                execution_id: execution_id.to_string(),
                message: "backend recorded the execution as failed".to_string(),
            });
        }
        Ok(entry)
    }

    /// Download one artifact.
    pub async fn fetch_artifact(&self, artifact: &ArtifactRef) -> ExecResult<Bytes> {
        let url = self.url(&format!("/view?{}", artifact.view_query()));
        let resp = self.http.get(&url).await?;
        if !resp.is_success() {
            return Err(ExecError::Protocol(format!(
                "artifact {} returned {}",
                artifact.filename, resp.status
            )));
        }
        Ok(resp.body)
    }

    /// Submit `graph`, wait until the backend reports it finished, and
    /// download every image and video it produced, grouped by node.
    pub async fn run_to_completion(&mut self, graph: &Map<String, Value>) -> ExecResult<Artifacts> {
        if self.channel.is_none() {
            return Err(ExecError::NotConnected);
        }

        let mut execution = self.submit(graph).await?;
        self.wait_for_completion(&mut execution).await?;

        let manifest = self.get_result(&execution.execution_id).await?;
        execution.output_refs = manifest.artifact_refs();

        let mut artifacts = Artifacts::new();
        for (node_id, output) in manifest.artifact_nodes() {
            let mut fetched = Vec::new();
            for (n, artifact) in output.artifacts().enumerate() {
                let data = self.fetch_artifact(artifact).await?;
                if let Some(dir) = &self.output_dir {
                    persist_artifact(dir, &execution.execution_id, node_id, n, artifact, &data).await?;
                }
                fetched.push(data);
            }
            artifacts.insert(node_id.clone(), fetched);
        }

        info!(
            execution_id = %execution.execution_id,
            nodes = artifacts.len(),
            artifacts = execution.output_refs.len(),
            "execution finished"
        );
        Ok(artifacts)
    }

    /// [`run_to_completion`](Self::run_to_completion) bounded by `deadline`.
    ///
    /// On expiry the progress channel is dropped, since it may still carry
    /// frames for the abandoned execution.
    pub async fn run_with_deadline(
        &mut self,
        graph: &Map<String, Value>,
        deadline: Option<Duration>,
    ) -> ExecResult<Artifacts> {
        let Some(after) = deadline else {
            return self.run_to_completion(graph).await;
        };
        match tokio::time::timeout(after, self.run_to_completion(graph)).await {
            Ok(result) => result,
            Err(_) => {
                self.disconnect().await;
                Err(ExecError::Timeout { after })
            }
        }
    }

    async fn wait_for_completion(&mut self, execution: &mut WorkflowExecution) -> ExecResult<()> {
        let channel = self.channel.as_mut().ok_or(ExecError::NotConnected)?;

        loop {
            let frame = match channel.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    self.channel = None;
                    execution.status = ExecutionStatus::Failed;
                    return Err(ExecError::Disconnected(e.to_string()));
                }
                None => {
                    self.channel = None;
                    execution.status = ExecutionStatus::Failed;
                    return Err(ExecError::Disconnected("stream ended".to_string()));
                }
            };

            let text = match frame {
                Message::Text(text) => text,
                // Previews arrive as binary frames.
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(reason) => {
                    self.channel = None;
                    execution.status = ExecutionStatus::Failed;
                    return Err(ExecError::Disconnected(format!("closed by backend: {reason:?}")));
                }
            };

            let event = match ProgressEvent::parse(text.as_str()) {
                Ok(ev) => ev,
                Err(e) => {
                    debug!(error = %e, "ignoring undecodable progress frame");
                    continue;
                }
            };

            if event.completes(&execution.execution_id) {
                execution.status = ExecutionStatus::Completed;
                execution.current_node = None;
                return Ok(());
            }

            match event {
                ProgressEvent::Executing {
                    node: Some(node),
                    execution_id: Some(id),
                } if id == execution.execution_id => {
                    debug!(execution_id = %id, %node, "executing node");
                    execution.status = ExecutionStatus::Executing;
                    execution.current_node = Some(node);
                }
                ProgressEvent::ExecutionInterrupted {
                    execution_id: Some(id),
                    node,
                } if id == execution.execution_id => {
                    warn!(execution_id = %id, node = ?node, "execution interrupted");
                    execution.status = ExecutionStatus::Failed;
                    return Err(ExecError::ExecutionFailed {
                        execution_id: id,
                        message: "interrupted before completion".to_string(),
                    });
                }
                ProgressEvent::ExecutionError {
                    execution_id: Some(id),
                    node,
                    message,
                } if id == execution.execution_id => {
                    warn!(execution_id = %id, node = ?node, %message, "execution error reported");
                    execution.status = ExecutionStatus::Failed;
                    return Err(ExecError::ExecutionFailed {
                        execution_id: id,
                        message,
                    });
                }
                _ => {}
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.address)
    }
}

fn classify_connect_error(address: &str, e: tokio_tungstenite::tungstenite::Error) -> ExecError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Io(io) if is_not_listening(&io) => ExecError::NotReady {
            address: address.to_string(),
            reason: io.to_string(),
        },
        // A backend still booting answers the upgrade with 5xx.
        WsError::Http(resp) if resp.status().is_server_error() => ExecError::NotReady {
            address: address.to_string(),
            reason: format!("upgrade answered {}", resp.status()),
        },
        other => ExecError::Connect(other.to_string()),
    }
}

fn is_not_listening(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

/// Write one artifact as `<dir>/<execution_id>/<node>_<n>.<ext>`, where
/// `n` is its position among the node's outputs.
async fn persist_artifact(
    dir: &Path,
    execution_id: &str,
    node_id: &str,
    n: usize,
    artifact: &ArtifactRef,
    data: &[u8],
) -> ExecResult<()> {
    let target_dir = dir.join(execution_id);
    tokio::fs::create_dir_all(&target_dir).await?;
    let path = target_dir.join(artifact_file_name(node_id, n, &artifact.filename));
    tokio::fs::write(&path, data).await?;
    debug!(path = %path.display(), bytes = data.len(), "artifact written");
    Ok(())
}

fn artifact_file_name(node_id: &str, n: usize, filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());
    format!("{node_id}_{n}.{ext}")
}
