//! Local mode: jobs from a file, an in-memory queue and a one-member
//! group. Used to exercise a backend without any cloud resources.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backlog_autoscale::{Autoscaler, ScalingPolicy};
use backlog_core::{Job, MemoryGroup, MemoryQueue, WorkerConfig};
use backlog_metadata::NeverTerminating;
use backlog_worker::{BackendRunner, Worker, WorkerSettings};
use tokio::sync::watch;
use tracing::info;

/// Visibility timeout of the in-memory queue when none is configured.
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(300);

pub async fn run(config: WorkerConfig, jobs: &Path, until_empty: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(jobs)
        .with_context(|| format!("reading jobs from {}", jobs.display()))?;
    let bodies = parse_jobs(&text)?;

    let queue = Arc::new(MemoryQueue::new(
        config.visibility_timeout().unwrap_or(DEFAULT_VISIBILITY),
    ));
    for body in &bodies {
        queue.push(body.clone());
    }
    info!(jobs = bodies.len(), backend = %config.backend.address, "backlogd starting in local mode");

    let group = Arc::new(MemoryGroup::new(1));
    let scaler = Autoscaler::new(ScalingPolicy::from(&config.scaling), queue.clone(), group);
    let mut worker = Worker::new(
        WorkerSettings::from_config("local", &config),
        queue.clone(),
        scaler,
        Arc::new(NeverTerminating),
        Box::new(BackendRunner::from_config(&config.backend)),
        crate::notifier(&config)?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watched = queue.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = crate::shutdown_signal() => {}
            _ = wait_until_empty(&watched), if until_empty => {
                info!("every job acknowledged");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    let stats = worker.stats();
    info!(
        received = stats.received,
        completed = stats.completed,
        failed = stats.failed,
        left = queue.len(),
        "backlogd stopped"
    );
    Ok(())
}

async fn wait_until_empty(queue: &MemoryQueue) {
    while !queue.is_empty() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Split a JSON-lines file into job bodies. Blank lines and lines
/// starting with `#` are skipped; every other line must be a valid job.
pub fn parse_jobs(text: &str) -> anyhow::Result<Vec<String>> {
    let mut bodies = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let job = Job::parse(line).with_context(|| format!("line {}", n + 1))?;
        bodies.push(job.to_body());
    }
    Ok(bodies)
}
