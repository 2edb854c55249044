//! Self-termination detection and lifecycle acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backlog_core::ScalingGroup;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::MetadataClient;
use crate::error::MetadataResult;

/// Metadata key holding the scaling group's intent for this instance.
pub const LIFECYCLE_STATE_KEY: &str = "autoscaling/target-lifecycle-state";

/// Target lifecycle states that mean this instance is going away.
pub const TERMINATING_STATES: [&str; 3] =
    ["Terminated", "Terminating:Wait", "Terminating:Proceed"];

/// What the worker loop needs from termination handling.
#[async_trait]
pub trait TerminationCheck: Send + Sync {
    /// Whether the instance has been selected for termination.
    async fn is_self_terminating(&self) -> bool;

    /// Tell the scaling group this instance has drained and may go.
    async fn acknowledge_termination(&self) -> MetadataResult<()>;
}

/// Check for environments without a scaling group (local runs).
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverTerminating;

#[async_trait]
impl TerminationCheck for NeverTerminating {
    async fn is_self_terminating(&self) -> bool {
        false
    }

    async fn acknowledge_termination(&self) -> MetadataResult<()> {
        Ok(())
    }
}

struct CheckState {
    last_check_at: Option<Instant>,
    terminating: bool,
    acknowledged: bool,
}

/// Rate-limited termination watch backed by the metadata endpoint.
pub struct TerminationWatch {
    client: Arc<MetadataClient>,
    group: Arc<dyn ScalingGroup>,
    check_interval: Duration,
    state: Mutex<CheckState>,
}

impl TerminationWatch {
    pub fn new(
        client: Arc<MetadataClient>,
        group: Arc<dyn ScalingGroup>,
        check_interval: Duration,
    ) -> Self {
        Self {
            client,
            group,
            check_interval,
            state: Mutex::new(CheckState {
                last_check_at: None,
                terminating: false,
                acknowledged: false,
            }),
        }
    }

    /// Whether `state` is one of [`TERMINATING_STATES`].
    pub fn is_terminating_state(state: &str) -> bool {
        TERMINATING_STATES.contains(&state.trim())
    }
}

#[async_trait]
impl TerminationCheck for TerminationWatch {
    /// Reads the lifecycle state at most once per check interval and
    /// returns the cached verdict in between.
    ///
    /// A terminating verdict is sticky. Failed reads count as a check and
    /// leave the previous verdict in place.
    async fn is_self_terminating(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.terminating {
            return true;
        }
        if let Some(last) = state.last_check_at
            && last.elapsed() < self.check_interval
        {
            return state.terminating;
        }
        state.last_check_at = Some(Instant::now());

        match self.client.read(LIFECYCLE_STATE_KEY).await {
            Ok(Some(value)) => {
                let terminating = Self::is_terminating_state(&value);
                if terminating {
                    info!(lifecycle_state = %value.trim(), "instance selected for termination");
                } else {
                    debug!(lifecycle_state = %value.trim(), "lifecycle state checked");
                }
                state.terminating = terminating;
            }
            Ok(None) => {
                debug!("no lifecycle state published, not terminating");
            }
            Err(e) => {
                warn!(error = %e, "lifecycle state check failed");
            }
        }
        state.terminating
    }

    /// Idempotent: once the hook has been released, later calls return
    /// immediately.
    async fn acknowledge_termination(&self) -> MetadataResult<()> {
        let mut state = self.state.lock().await;
        if state.acknowledged {
            debug!("termination already acknowledged");
            return Ok(());
        }

        let instance_id = self.client.instance_id().await?;
        if let Err(e) = self.group.complete_lifecycle(&instance_id).await {
            warn!(%instance_id, error = %e, "failed to acknowledge termination");
            return Err(e.into());
        }

        state.acknowledged = true;
        info!(%instance_id, "termination acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminating_states() {
        for s in ["Terminated", "Terminating:Wait", "Terminating:Proceed", "Terminating:Wait\n"] {
            assert!(TerminationWatch::is_terminating_state(s), "{s}");
        }
        for s in ["InService", "Pending", "Warmed:Stopped", "terminated", ""] {
            assert!(!TerminationWatch::is_terminating_state(s), "{s}");
        }
    }

    #[tokio::test]
    async fn never_terminating_is_inert() {
        let termination = NeverTerminating;
        assert!(!termination.is_self_terminating().await);
        termination.acknowledge_termination().await.unwrap();
    }
}
