//! Producer side: put a job on the shared queue.

use backlog_autoscale::{Autoscaler, ScaleDecision};
use backlog_core::{Job, ServiceResult, WorkQueue};
use tracing::info;

/// What [`submit`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub message_id: String,
    /// Outcome of the cold-start check run after enqueueing.
    pub scaling: ScaleDecision,
}

/// Enqueue `job`, then give an empty group its first member.
///
/// Only the cold-start rule runs here. Sizing a running group is left to
/// the workers' cooldown-gated evaluations.
pub async fn submit(queue: &dyn WorkQueue, scaler: &mut Autoscaler, job: &Job) -> ServiceResult<Submission> {
    let message_id = queue.send(&job.to_body()).await?;
    info!(%message_id, kind = job.kind(), "job submitted");
    let scaling = scaler.evaluate_bootstrap().await;
    Ok(Submission { message_id, scaling })
}
