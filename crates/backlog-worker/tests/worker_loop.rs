//! Worker loop against the in-memory queue and group.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use backlog_autoscale::{Autoscaler, ScalingPolicy};
use backlog_core::{Job, MemoryGroup, MemoryQueue, Notifier, ReceiveOptions};
use backlog_exec::{CommandOutput, ExecError, ExecResult};
use backlog_metadata::{MetadataError, MetadataResult, TerminationCheck};
use backlog_worker::{ExitReason, JobOutcome, JobRunner, Step, Worker, WorkerSettings, WorkerState};

const VISIBILITY: Duration = Duration::from_secs(30);

#[derive(Default)]
struct RunnerLog {
    connected: bool,
    refuse_connects: u32,
    /// Refuse every connect once the channel has been lost.
    stay_down: bool,
    connect_attempts: u32,
    jobs: Vec<Job>,
    failures: VecDeque<ExecError>,
}

/// Scripted runner. Jobs succeed unless a failure is queued for them.
#[derive(Clone, Default)]
struct FakeRunner {
    log: Arc<Mutex<RunnerLog>>,
}

impl FakeRunner {
    fn connected() -> Self {
        let runner = Self::default();
        runner.log.lock().unwrap().connected = true;
        runner
    }

    fn refusing(connects: u32) -> Self {
        let runner = Self::default();
        runner.log.lock().unwrap().refuse_connects = connects;
        runner
    }

    fn fail_next(&self, err: ExecError) {
        self.log.lock().unwrap().failures.push_back(err);
    }

    fn jobs(&self) -> Vec<Job> {
        self.log.lock().unwrap().jobs.clone()
    }

    fn connect_attempts(&self) -> u32 {
        self.log.lock().unwrap().connect_attempts
    }
}

#[async_trait]
impl JobRunner for FakeRunner {
    fn is_ready(&self) -> bool {
        self.log.lock().unwrap().connected
    }

    async fn connect(&mut self) -> ExecResult<()> {
        let mut log = self.log.lock().unwrap();
        log.connect_attempts += 1;
        if log.refuse_connects > 0 {
            log.refuse_connects -= 1;
            return Err(ExecError::NotReady {
                address: "127.0.0.1:8188".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        log.connected = true;
        Ok(())
    }

    async fn run(&mut self, job: &Job) -> ExecResult<JobOutcome> {
        let mut log = self.log.lock().unwrap();
        log.jobs.push(job.clone());
        match log.failures.pop_front() {
            Some(err) => {
                if err.needs_reconnect() {
                    log.connected = false;
                    if log.stay_down {
                        log.refuse_connects = u32::MAX;
                    }
                }
                Err(err)
            }
            None => Ok(JobOutcome::Command(CommandOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })),
        }
    }
}

#[derive(Default)]
struct FakeTermination {
    checks: AtomicU32,
    /// The check from which on the instance reports terminating.
    terminate_from: Option<u32>,
    acks: AtomicU32,
    fail_acks: AtomicBool,
}

impl FakeTermination {
    fn terminating_from(check: u32) -> Self {
        Self {
            terminate_from: Some(check),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TerminationCheck for FakeTermination {
    async fn is_self_terminating(&self) -> bool {
        let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        self.terminate_from.is_some_and(|from| n >= from)
    }

    async fn acknowledge_termination(&self) -> MetadataResult<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(MetadataError::NotFound("instance-id".to_string()));
        }
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

struct Harness {
    queue: MemoryQueue,
    group: MemoryGroup,
    runner: FakeRunner,
    termination: Arc<FakeTermination>,
    notifier: Arc<RecordingNotifier>,
    worker: Worker,
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        name: "i-0abc123".to_string(),
        receive: ReceiveOptions {
            max_messages: 1,
            wait: Duration::from_secs(1),
            visibility_timeout: None,
        },
        connect_retry: Duration::from_millis(100),
        error_delay: Duration::from_millis(100),
        drain_command: None,
        drain_timeout: Duration::from_secs(10),
    }
}

fn harness(settings: WorkerSettings, runner: FakeRunner, termination: FakeTermination, members: u32) -> Harness {
    let queue = MemoryQueue::new(VISIBILITY);
    let group = MemoryGroup::new(members);
    let termination = Arc::new(termination);
    let notifier = Arc::new(RecordingNotifier::default());
    let policy = ScalingPolicy {
        min_members: 0,
        max_members: 5,
        backlog_per_member_threshold: 3.0,
        cooldown: Duration::from_secs(60),
        member_settle: Duration::from_secs(30),
    };
    let scaler = Autoscaler::new(policy, Arc::new(queue.clone()), Arc::new(group.clone()));
    let worker = Worker::new(
        settings,
        Arc::new(queue.clone()),
        scaler,
        termination.clone(),
        Box::new(runner.clone()),
        notifier.clone(),
    );
    Harness {
        queue,
        group,
        runner,
        termination,
        notifier,
        worker,
    }
}

fn command_job(cmd: &str) -> String {
    Job::Command {
        exec_cmd: cmd.to_string(),
    }
    .to_body()
}

#[tokio::test(start_paused = true)]
async fn completed_job_is_deleted_exactly_once() {
    let mut h = harness(settings(), FakeRunner::connected(), FakeTermination::default(), 1);
    let (_tx, mut rx) = watch::channel(false);
    h.queue.push(command_job("echo hi"));

    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Continue);
    assert_eq!(h.queue.deleted(), 1);
    assert!(h.queue.is_empty());
    assert_eq!(h.runner.jobs().len(), 1);

    // Nothing left: an empty long-poll deletes nothing further.
    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Continue);
    assert_eq!(h.queue.deleted(), 1);
    assert_eq!(h.worker.stats().completed, 1);
}

#[tokio::test(start_paused = true)]
async fn graph_jobs_reach_the_runner_intact() {
    let mut h = harness(settings(), FakeRunner::connected(), FakeTermination::default(), 1);
    let (_tx, mut rx) = watch::channel(false);
    let body = r#"{"3":{"class_type":"KSampler","inputs":{"seed":7}}}"#;
    h.queue.push(body);

    h.worker.poll_once(&mut rx).await;
    assert_eq!(h.runner.jobs(), vec![Job::parse(body).unwrap()]);
    assert_eq!(h.queue.deleted(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_job_is_left_on_the_queue() {
    let mut h = harness(settings(), FakeRunner::connected(), FakeTermination::default(), 1);
    let (_tx, mut rx) = watch::channel(false);
    let id = h.queue.push("not json at all");

    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Continue);
    assert_eq!(h.queue.deleted(), 0);
    assert_eq!(h.queue.len(), 1);
    assert!(h.runner.jobs().is_empty());
    assert_eq!(h.worker.stats().failed, 1);

    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    h.worker.poll_once(&mut rx).await;
    assert_eq!(h.queue.receive_count(&id), Some(2));
    assert_eq!(h.queue.deleted(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_job_is_not_deleted_and_comes_back() {
    let runner = FakeRunner::connected();
    runner.fail_next(ExecError::ExecutionFailed {
        execution_id: "p1".to_string(),
        message: "CUDA out of memory".to_string(),
    });
    let mut h = harness(settings(), runner, FakeTermination::default(), 1);
    let (_tx, mut rx) = watch::channel(false);
    let id = h.queue.push(command_job("render"));

    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Continue);
    assert_eq!(h.queue.deleted(), 0);
    assert_eq!(h.queue.receive_count(&id), Some(1));

    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Continue);
    assert_eq!(h.runner.jobs().len(), 2);
    assert_eq!(h.queue.deleted(), 1);
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropped_channel_asks_for_reconnect() {
    let runner = FakeRunner::connected();
    runner.fail_next(ExecError::Disconnected("stream ended".to_string()));
    let mut h = harness(settings(), runner, FakeTermination::default(), 1);
    let (_tx, mut rx) = watch::channel(false);
    h.queue.push(command_job("render"));

    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Reconnect);
    assert_eq!(h.queue.deleted(), 0);
}

#[tokio::test(start_paused = true)]
async fn terminating_instance_drains_instead_of_processing() {
    let mut h = harness(settings(), FakeRunner::default(), FakeTermination::terminating_from(1), 1);
    let (_tx, rx) = watch::channel(false);
    let id = h.queue.push(command_job("render"));

    assert_eq!(h.worker.run(rx).await, ExitReason::Terminated);
    assert_eq!(h.worker.state(), WorkerState::Terminated);

    assert!(h.runner.jobs().is_empty());
    assert_eq!(h.queue.deleted(), 0);
    assert_eq!(h.queue.receive_count(&id), Some(1));
    assert_eq!(h.termination.acks.load(Ordering::SeqCst), 1);

    let messages = h.notifier.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("i-0abc123"));
}

#[tokio::test(start_paused = true)]
async fn drains_on_the_check_after_a_finished_job() {
    let mut h = harness(settings(), FakeRunner::default(), FakeTermination::terminating_from(2), 1);
    let (_tx, rx) = watch::channel(false);
    h.queue.push(command_job("first"));
    let second = h.queue.push(command_job("second"));

    assert_eq!(h.worker.run(rx).await, ExitReason::Terminated);
    assert_eq!(h.runner.jobs().len(), 1);
    assert_eq!(h.queue.deleted(), 1);
    assert_eq!(h.queue.receive_count(&second), Some(1));
    assert_eq!(h.termination.checks.load(Ordering::SeqCst), 2);
    assert_eq!(h.termination.acks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_acknowledgment_still_terminates() {
    let termination = FakeTermination::terminating_from(1);
    termination.fail_acks.store(true, Ordering::SeqCst);
    let mut h = harness(settings(), FakeRunner::default(), termination, 1);
    let (_tx, rx) = watch::channel(false);

    assert_eq!(h.worker.run(rx).await, ExitReason::Terminated);
    assert_eq!(h.termination.acks.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn scaling_is_evaluated_between_jobs() {
    let mut h = harness(settings(), FakeRunner::connected(), FakeTermination::default(), 0);
    let (_tx, mut rx) = watch::channel(false);
    h.queue.push(command_job("a"));
    h.queue.push(command_job("b"));

    h.worker.poll_once(&mut rx).await;
    // One job still visible and no members: cold start.
    assert_eq!(h.group.requests(), vec![1]);

    h.worker.poll_once(&mut rx).await;
    assert_eq!(h.group.requests(), vec![1], "cooldown gates the next evaluation");
    assert_eq!(h.queue.deleted(), 2);
}

#[tokio::test(start_paused = true)]
async fn queue_errors_are_absorbed() {
    let mut h = harness(settings(), FakeRunner::connected(), FakeTermination::default(), 1);
    let (_tx, mut rx) = watch::channel(false);

    h.queue.set_unavailable(true);
    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Continue);
    assert_eq!(h.worker.stats().received, 0);
    assert_eq!(h.termination.checks.load(Ordering::SeqCst), 0);

    h.queue.set_unavailable(false);
    h.queue.push(command_job("a"));
    assert_eq!(h.worker.poll_once(&mut rx).await, Step::Continue);
    assert_eq!(h.queue.deleted(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_is_retried_until_the_backend_is_ready() {
    let h = harness(settings(), FakeRunner::refusing(2), FakeTermination::default(), 1);
    let Harness {
        queue,
        runner,
        mut worker,
        ..
    } = h;
    queue.push(command_job("a"));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });

    while queue.deleted() < 1 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tx.send(true).unwrap();

    assert_eq!(handle.await.unwrap(), ExitReason::Shutdown);
    assert_eq!(runner.connect_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn lost_channel_reconnects_before_the_next_job() {
    let runner = FakeRunner::default();
    runner.fail_next(ExecError::Disconnected("closed by backend".to_string()));
    let Harness {
        queue,
        runner,
        mut worker,
        ..
    } = harness(settings(), runner, FakeTermination::default(), 1);
    queue.push(command_job("a"));
    queue.push(command_job("b"));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });

    while queue.deleted() < 1 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tx.send(true).unwrap();

    assert_eq!(handle.await.unwrap(), ExitReason::Shutdown);
    assert_eq!(runner.connect_attempts(), 2);
    assert_eq!(runner.jobs().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_still_drains_on_termination() {
    let runner = FakeRunner::default();
    runner.fail_next(ExecError::Disconnected("closed by backend".to_string()));
    runner.log.lock().unwrap().stay_down = true;
    let mut h = harness(settings(), runner, FakeTermination::terminating_from(2), 1);
    let (_tx, rx) = watch::channel(false);
    let id = h.queue.push(command_job("render"));

    assert_eq!(h.worker.run(rx).await, ExitReason::Terminated);
    assert_eq!(h.runner.connect_attempts(), 2);
    assert_eq!(h.runner.jobs().len(), 1);
    assert_eq!(h.queue.deleted(), 0);
    assert_eq!(h.queue.receive_count(&id), Some(1));
    assert_eq!(h.termination.acks.load(Ordering::SeqCst), 1);
    assert_eq!(h.notifier.messages.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_a_pending_long_poll() {
    let mut settings = settings();
    settings.receive.wait = Duration::from_secs(20);
    let Harness { mut worker, .. } = harness(settings, FakeRunner::default(), FakeTermination::default(), 1);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let reason = worker.run(rx).await;
        (reason, worker.state())
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    tx.send(true).unwrap();

    let (reason, state) = handle.await.unwrap();
    assert_eq!(reason, ExitReason::Shutdown);
    assert_eq!(state, WorkerState::Polling);
}

#[tokio::test]
async fn drain_command_runs_before_release() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("drained");
    let mut settings = settings();
    settings.drain_command = Some(format!("touch '{}'", marker.display()));
    let mut h = harness(settings, FakeRunner::default(), FakeTermination::terminating_from(1), 1);
    let (_tx, rx) = watch::channel(false);

    assert_eq!(h.worker.run(rx).await, ExitReason::Terminated);
    assert!(marker.exists());
    assert_eq!(h.termination.acks.load(Ordering::SeqCst), 1);
}
