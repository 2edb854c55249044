//! The worker state machine.

use std::sync::Arc;
use std::time::Duration;

use backlog_autoscale::{Autoscaler, ScaleDecision};
use backlog_core::{Notifier, QueueMessage, ReceiveOptions, WorkQueue, WorkerConfig};
use backlog_exec::{CommandRunner, ExecError};
use backlog_metadata::TerminationCheck;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::runner::JobRunner;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the execution backend to accept the progress channel.
    Connecting,
    Ready,
    Polling,
    /// Selected for termination; finishing up before releasing the hook.
    Draining,
    Terminated,
}

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The instance drained and released its termination hook.
    Terminated,
    /// A shutdown signal was received.
    Shutdown,
}

/// Outcome of one polling iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The instance is going away; stop taking work.
    Drain,
    /// The runner lost its backend connection.
    Reconnect,
    Shutdown,
}

/// Loop counters, reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Timing and hooks for the loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Label used in notifications (instance id or host name).
    pub name: String,
    pub receive: ReceiveOptions,
    pub connect_retry: Duration,
    pub error_delay: Duration,
    pub drain_command: Option<String>,
    pub drain_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(name: impl Into<String>, config: &WorkerConfig) -> Self {
        Self {
            name: name.into(),
            receive: ReceiveOptions {
                max_messages: 1,
                wait: config.queue_wait(),
                visibility_timeout: config.visibility_timeout(),
            },
            connect_retry: Duration::from_secs(config.backend.connect_retry_secs),
            error_delay: Duration::from_secs(config.worker.error_delay_secs),
            drain_command: config.worker.drain_command.clone(),
            drain_timeout: Duration::from_secs(config.worker.drain_timeout_secs),
        }
    }
}

/// Pulls jobs from the queue one at a time and runs them.
pub struct Worker {
    settings: WorkerSettings,
    queue: Arc<dyn WorkQueue>,
    scaler: Autoscaler,
    termination: Arc<dyn TerminationCheck>,
    runner: Box<dyn JobRunner>,
    notifier: Arc<dyn Notifier>,
    state: WorkerState,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        queue: Arc<dyn WorkQueue>,
        scaler: Autoscaler,
        termination: Arc<dyn TerminationCheck>,
        runner: Box<dyn JobRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            queue,
            scaler,
            termination,
            runner,
            notifier,
            state: WorkerState::Connecting,
            stats: WorkerStats::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Drive the state machine until the instance terminates or `shutdown`
    /// flips. A job already running when shutdown arrives is finished
    /// first; a pending long-poll is abandoned.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        info!(worker = %self.settings.name, "worker loop starting");

        loop {
            if *shutdown.borrow() {
                return self.stop();
            }

            match self.state {
                WorkerState::Connecting => match self.connect(&mut shutdown).await {
                    Step::Continue => self.state = WorkerState::Ready,
                    Step::Drain => self.state = WorkerState::Draining,
                    Step::Reconnect | Step::Shutdown => return self.stop(),
                },
                WorkerState::Ready => {
                    info!(worker = %self.settings.name, "execution backend connected, polling for jobs");
                    self.state = WorkerState::Polling;
                }
                WorkerState::Polling => match self.poll_once(&mut shutdown).await {
                    Step::Continue => {}
                    Step::Drain => self.state = WorkerState::Draining,
                    Step::Reconnect => self.state = WorkerState::Connecting,
                    Step::Shutdown => return self.stop(),
                },
                WorkerState::Draining => {
                    self.drain().await;
                    self.state = WorkerState::Terminated;
                }
                WorkerState::Terminated => {
                    info!(
                        completed = self.stats.completed,
                        failed = self.stats.failed,
                        "worker terminated"
                    );
                    return ExitReason::Terminated;
                }
            }
        }
    }

    /// Retry the backend connection at a fixed interval until it succeeds.
    /// Between attempts the instance is checked for termination.
    async fn connect(&mut self, shutdown: &mut watch::Receiver<bool>) -> Step {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.runner.connect().await {
                Ok(()) => return Step::Continue,
                Err(ExecError::NotReady { address, reason }) => {
                    info!(%address, %reason, attempt, "execution backend not ready yet");
                }
                Err(e) => {
                    warn!(error = %e, attempt, "failed to connect to execution backend");
                }
            }

            if self.termination.is_self_terminating().await {
                warn!(attempt, "instance terminating while the backend is unreachable");
                return Step::Drain;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.connect_retry) => {}
                _ = shutdown.changed() => return Step::Shutdown,
            }
        }
    }

    /// One iteration: receive, check for termination, scale, process.
    pub async fn poll_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> Step {
        let queue = self.queue.clone();
        let received = tokio::select! {
            r = queue.receive(self.settings.receive) => r,
            _ = shutdown.changed() => return Step::Shutdown,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "failed to receive from queue");
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.error_delay) => {}
                    _ = shutdown.changed() => return Step::Shutdown,
                }
                return Step::Continue;
            }
        };
        self.stats.received += messages.len() as u64;

        if self.termination.is_self_terminating().await {
            if let Some(msg) = messages.first() {
                info!(message_id = %msg.message_id, "leaving received job for another worker");
            }
            return Step::Drain;
        }

        if let Some(decision) = self.scaler.evaluate_if_due().await {
            match decision {
                ScaleDecision::ScaleTo(target) => info!(target, "scaling evaluation requested capacity change"),
                ScaleDecision::NoChange => debug!("scaling evaluation: no change"),
            }
        }

        let mut reconnect = false;
        for msg in &messages {
            if let Err(e) = self.process(msg).await
                && e.needs_reconnect()
            {
                reconnect = true;
            }
        }

        if reconnect || !self.runner.is_ready() {
            return Step::Reconnect;
        }
        Step::Continue
    }

    /// Run one message's job. The message is deleted only when the job
    /// succeeded; otherwise it reappears after its visibility timeout.
    async fn process(&mut self, msg: &QueueMessage) -> Result<(), ExecError> {
        if msg.is_redelivery() {
            warn!(
                message_id = %msg.message_id,
                receive_count = msg.receive_count,
                "job redelivered after an earlier attempt"
            );
        }

        let job = match msg.job() {
            Ok(job) => job,
            Err(e) => {
                self.stats.failed += 1;
                error!(message_id = %msg.message_id, error = %e, "malformed job, leaving it on the queue");
                return Ok(());
            }
        };

        info!(message_id = %msg.message_id, kind = job.kind(), "running job");
        match self.runner.run(&job).await {
            Ok(outcome) => {
                self.stats.completed += 1;
                info!(
                    message_id = %msg.message_id,
                    kind = job.kind(),
                    artifacts = outcome.artifact_count(),
                    "job completed"
                );
                if let Err(e) = self.queue.delete(&msg.receipt).await {
                    warn!(message_id = %msg.message_id, error = %e, "failed to delete completed job");
                }
                Ok(())
            }
            Err(e) => {
                self.stats.failed += 1;
                error!(message_id = %msg.message_id, kind = job.kind(), error = %e, "job failed");
                Err(e)
            }
        }
    }

    async fn drain(&mut self) {
        info!(worker = %self.settings.name, "draining before termination");

        if let Some(command) = &self.settings.drain_command {
            let runner = CommandRunner::new().with_timeout(Some(self.settings.drain_timeout));
            if let Err(e) = runner.run(command).await {
                warn!(error = %e, "drain command failed");
            }
        }

        self.notifier
            .notify(&format!(
                "{}: terminating after {} completed and {} failed jobs",
                self.settings.name, self.stats.completed, self.stats.failed
            ))
            .await;

        if let Err(e) = self.termination.acknowledge_termination().await {
            error!(error = %e, "could not release termination hook");
        }
    }

    fn stop(&mut self) -> ExitReason {
        info!(
            state = ?self.state,
            completed = self.stats.completed,
            failed = self.stats.failed,
            "worker loop stopping on shutdown"
        );
        ExitReason::Shutdown
    }
}
