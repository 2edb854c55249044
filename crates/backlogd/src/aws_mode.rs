//! Cloud mode: the real queue, the real scaling group, and the instance
//! metadata endpoint.
//!
//! Startup order:
//! 1. Metadata client (unless disabled), which also supplies the region
//!    and instance id when the configuration leaves them out
//! 2. Shared SDK configuration (default credential chain)
//! 3. Queue URL resolution (fatal when the queue does not exist)
//! 4. Termination watch, scaler, runner, notifier
//! 5. Worker loop until the instance terminates or a signal arrives
//!
//! [`send`] reuses steps 1 to 3 to enqueue one job from outside the group.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backlog_autoscale::{Autoscaler, ScaleDecision, ScalingPolicy};
use backlog_aws::{AutoScalingGroup, SqsQueue};
use backlog_core::{Job, ScalingGroup, WorkQueue, WorkerConfig};
use backlog_metadata::{MetadataClient, NeverTerminating, TerminationCheck, TerminationWatch};
use backlog_worker::{BackendRunner, ExitReason, Worker, WorkerSettings};
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    info!("backlogd starting");

    // ── Instance metadata ────────────────────────────────────────
    let metadata = metadata_client(&config);
    let region = resolve_region(&config, metadata.as_deref()).await?;

    let name = match &metadata {
        Some(metadata) => match metadata.instance_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "instance id unavailable, using host name");
                host_name()
            }
        },
        None => host_name(),
    };
    info!(%region, worker = %name, "instance identified");

    // ── Service clients ──────────────────────────────────────────
    let (queue, group) = services(&config, &region).await?;

    // ── Termination watch ────────────────────────────────────────
    let termination: Arc<dyn TerminationCheck> = match metadata {
        Some(metadata) => Arc::new(TerminationWatch::new(
            metadata,
            group.clone(),
            Duration::from_secs(config.metadata.check_interval_secs),
        )),
        None => {
            warn!("metadata disabled, termination will not be detected");
            Arc::new(NeverTerminating)
        }
    };

    // ── Worker ───────────────────────────────────────────────────
    let scaler = Autoscaler::new(ScalingPolicy::from(&config.scaling), queue.clone(), group);
    let runner = BackendRunner::from_config(&config.backend);
    let mut worker = Worker::new(
        WorkerSettings::from_config(name, &config),
        queue,
        scaler,
        termination,
        Box::new(runner),
        crate::notifier(&config)?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        crate::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let reason = worker.run(shutdown_rx).await;
    let stats = worker.stats();
    match reason {
        ExitReason::Terminated => info!(
            completed = stats.completed,
            failed = stats.failed,
            "instance released, backlogd stopped"
        ),
        ExitReason::Shutdown => info!(
            completed = stats.completed,
            failed = stats.failed,
            "backlogd stopped"
        ),
    }
    Ok(())
}

/// Enqueue the job in `path` and start the first member of an empty group.
pub async fn send(config: WorkerConfig, path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading job from {}", path.display()))?;
    let job = Job::parse(text.trim()).with_context(|| format!("parsing job in {}", path.display()))?;

    let metadata = metadata_client(&config);
    let region = resolve_region(&config, metadata.as_deref()).await?;
    let (queue, group) = services(&config, &region).await?;

    let mut scaler = Autoscaler::new(ScalingPolicy::from(&config.scaling), queue.clone(), group);
    let submission = backlog_worker::submit(queue.as_ref(), &mut scaler, &job)
        .await
        .with_context(|| format!("sending job to {}", config.queue.name))?;

    match submission.scaling {
        ScaleDecision::ScaleTo(n) => info!(message_id = %submission.message_id, members = n, "job sent, group started"),
        ScaleDecision::NoChange => info!(message_id = %submission.message_id, "job sent"),
    }
    println!("{}", submission.message_id);
    Ok(())
}

fn metadata_client(config: &WorkerConfig) -> Option<Arc<MetadataClient>> {
    config.metadata.enabled.then(|| {
        Arc::new(MetadataClient::new(
            config.metadata.endpoint.clone(),
            Duration::from_secs(config.metadata.token_ttl_secs),
            Duration::from_secs(config.metadata.timeout_secs),
        ))
    })
}

/// Configured region, else the one the metadata endpoint reports.
async fn resolve_region(config: &WorkerConfig, metadata: Option<&MetadataClient>) -> anyhow::Result<String> {
    match (metadata, config.region.is_empty()) {
        (_, false) => Ok(config.region.clone()),
        (Some(metadata), true) => metadata
            .region()
            .await
            .context("region is not configured and the metadata endpoint did not supply one"),
        (None, true) => anyhow::bail!("region is not configured and metadata is disabled"),
    }
}

/// Queue and group adapters sharing one SDK configuration.
async fn services(
    config: &WorkerConfig,
    region: &str,
) -> anyhow::Result<(Arc<dyn WorkQueue>, Arc<dyn ScalingGroup>)> {
    let sdk = backlog_aws::load_config(region, config.endpoint_url.as_deref()).await;

    let queue: Arc<dyn WorkQueue> = Arc::new(
        SqsQueue::connect(&sdk, &config.queue.name)
            .await
            .with_context(|| format!("resolving queue {}", config.queue.name))?,
    );
    let group: Arc<dyn ScalingGroup> = Arc::new(AutoScalingGroup::new(
        &sdk,
        config.group.name.clone(),
        config.group.lifecycle_hook_name.clone(),
    ));
    info!(%region, queue = %config.queue.name, group = %config.group.name, "service clients ready");
    Ok((queue, group))
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "backlogd".to_string())
}
