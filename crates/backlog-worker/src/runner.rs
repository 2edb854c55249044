//! Job dispatch onto the execution backend or the host shell.

use std::time::Duration;

use async_trait::async_trait;
use backlog_core::config::BackendConfig;
use backlog_core::Job;
use backlog_exec::{Artifacts, CommandOutput, CommandRunner, ExecClient, ExecResult};

/// Request timeout for individual backend HTTP calls.
const BACKEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What a successful job produced.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Artifacts(Artifacts),
    Command(CommandOutput),
}

impl JobOutcome {
    /// Number of artifacts produced, zero for command jobs.
    pub fn artifact_count(&self) -> usize {
        match self {
            JobOutcome::Artifacts(a) => a.values().map(Vec::len).sum(),
            JobOutcome::Command(_) => 0,
        }
    }
}

/// Runs jobs for the worker loop.
///
/// Implementations are used by one loop at a time and may keep a
/// connection that has to be reopened after some failures.
#[async_trait]
pub trait JobRunner: Send {
    /// Whether jobs can be run without reconnecting first.
    fn is_ready(&self) -> bool;

    /// Open (or reopen) the connection to the backend.
    async fn connect(&mut self) -> ExecResult<()>;

    /// Run one job to completion.
    async fn run(&mut self, job: &Job) -> ExecResult<JobOutcome>;
}

/// [`JobRunner`] backed by the local execution backend and the host shell.
pub struct BackendRunner {
    client: ExecClient,
    commands: CommandRunner,
    deadline: Option<Duration>,
}

impl BackendRunner {
    pub fn new(client: ExecClient, commands: CommandRunner, deadline: Option<Duration>) -> Self {
        Self {
            client,
            commands,
            deadline,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        let deadline = config.execution_timeout();
        let mut client = ExecClient::new(config.address.clone(), BACKEND_REQUEST_TIMEOUT);
        if let Some(dir) = &config.output_dir {
            client = client.with_output_dir(dir);
        }
        Self::new(client, CommandRunner::new().with_timeout(deadline), deadline)
    }
}

#[async_trait]
impl JobRunner for BackendRunner {
    fn is_ready(&self) -> bool {
        self.client.is_connected()
    }

    async fn connect(&mut self) -> ExecResult<()> {
        self.client.reconnect().await
    }

    async fn run(&mut self, job: &Job) -> ExecResult<JobOutcome> {
        match job {
            Job::Command { exec_cmd } => self.commands.run(exec_cmd).await.map(JobOutcome::Command),
            Job::Graph(graph) => self
                .client
                .run_with_deadline(graph, self.deadline)
                .await
                .map(JobOutcome::Artifacts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backlog_exec::ExecError;
    use serde_json::Map;

    fn runner() -> BackendRunner {
        BackendRunner::from_config(&BackendConfig {
            address: "127.0.0.1:1".to_string(),
            ..BackendConfig::default()
        })
    }

    #[tokio::test]
    async fn command_jobs_run_on_the_host() {
        let mut runner = runner();
        let job = Job::Command {
            exec_cmd: "printf done".to_string(),
        };
        match runner.run(&job).await.unwrap() {
            JobOutcome::Command(out) => assert_eq!(out.stdout, "done"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn graph_jobs_need_the_channel() {
        let mut runner = runner();
        assert!(!runner.is_ready());
        let mut graph = Map::new();
        graph.insert("1".to_string(), serde_json::json!({"class_type": "SaveImage"}));
        let err = runner.run(&Job::Graph(graph)).await.unwrap_err();
        assert!(matches!(err, ExecError::NotConnected));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_not_ready() {
        let mut runner = runner();
        let err = runner.connect().await.unwrap_err();
        assert!(matches!(err, ExecError::NotReady { .. }), "got {err}");
    }

    #[test]
    fn artifact_count_sums_nodes() {
        let mut artifacts = Artifacts::new();
        artifacts.insert("9".to_string(), vec!["a".into(), "b".into()]);
        artifacts.insert("12".to_string(), vec!["c".into()]);
        assert_eq!(JobOutcome::Artifacts(artifacts).artifact_count(), 3);
    }
}
