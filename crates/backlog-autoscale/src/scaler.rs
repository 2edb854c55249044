//! Autoscaler — backlog-driven group sizing.
//!
//! Decisions are computed by pure functions over `(depth, members)` and
//! applied through the [`ScalingGroup`] boundary. Every read or write
//! failure is logged and turned into a no-op for that evaluation; the
//! next cooldown-gated evaluation retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use backlog_core::config::ScalingConfig;
use backlog_core::{GroupSize, ScalingGroup, ServiceResult, WorkQueue};

/// Stand-in for a cooldown too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A scaling decision for the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified member count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Bounds and tuning for the policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_members: u32,
    pub max_members: u32,
    pub backlog_per_member_threshold: f64,
    pub cooldown: Duration,
    pub member_settle: Duration,
}

impl From<&ScalingConfig> for ScalingPolicy {
    fn from(c: &ScalingConfig) -> Self {
        Self {
            min_members: c.min_members,
            max_members: c.max_members,
            backlog_per_member_threshold: c.backlog_per_member_threshold,
            cooldown: Duration::from_secs(c.cooldown_secs),
            member_settle: Duration::from_secs(c.member_settle_secs),
        }
    }
}

impl ScalingPolicy {
    /// Cold-start rule: a non-empty queue with no members gets one member.
    pub fn bootstrap(&self, depth: u64, members: u32) -> ScaleDecision {
        if depth > 0 && members == 0 {
            ScaleDecision::ScaleTo(1)
        } else {
            ScaleDecision::NoChange
        }
    }

    /// Backlog-per-member rule. Only defined for `members > 0`.
    pub fn backlog(&self, depth: u64, members: u32) -> ScaleDecision {
        if members == 0 {
            return ScaleDecision::NoChange;
        }

        let per_member = depth as f64 / members as f64;
        let threshold = self.backlog_per_member_threshold;

        if per_member > threshold {
            let target = members.saturating_add(1).min(self.max_members);
            if target > members {
                return ScaleDecision::ScaleTo(target);
            }
        } else if per_member < threshold {
            let floor = if depth > 0 {
                self.min_members.max(1)
            } else {
                self.min_members
            };
            let target = (members - 1).max(floor);
            if target < members {
                return ScaleDecision::ScaleTo(target);
            }
        }

        ScaleDecision::NoChange
    }
}

/// The autoscaler evaluates queue backlog and resizes the group.
pub struct Autoscaler {
    policy: ScalingPolicy,
    queue: Arc<dyn WorkQueue>,
    group: Arc<dyn ScalingGroup>,
    cooldown_until: Instant,
    /// Last requested capacity and when it was requested.
    last_change: Option<(Instant, u32)>,
}

impl Autoscaler {
    /// Create a new autoscaler. The first cooldown check passes immediately.
    pub fn new(policy: ScalingPolicy, queue: Arc<dyn WorkQueue>, group: Arc<dyn ScalingGroup>) -> Self {
        Self {
            policy,
            queue,
            group,
            cooldown_until: Instant::now(),
            last_change: None,
        }
    }

    /// Approximate queue depth.
    pub async fn queue_depth(&self) -> ServiceResult<u64> {
        self.queue.approximate_depth().await
    }

    /// Current group size.
    ///
    /// Within `member_settle` of a capacity request the requested value is
    /// returned as both live and desired without asking the group again.
    pub async fn member_count(&self) -> ServiceResult<GroupSize> {
        if let Some((at, desired)) = self.last_change
            && at.elapsed() < self.policy.member_settle
        {
            return Ok(GroupSize::settled(desired));
        }
        self.group.describe_members().await
    }

    /// Ask the group to converge to `desired` members.
    pub async fn request_capacity(&mut self, desired: u32) -> ServiceResult<()> {
        self.group.set_desired_count(desired).await?;
        self.last_change = Some((Instant::now(), desired));
        Ok(())
    }

    pub fn cooldown_elapsed(&self) -> bool {
        Instant::now() >= self.cooldown_until
    }

    pub fn reset_cooldown(&mut self) {
        let now = Instant::now();
        // An unrepresentable deadline means the cooldown never ends.
        self.cooldown_until = now.checked_add(self.policy.cooldown).unwrap_or(now + FAR_FUTURE);
    }

    /// Apply the cold-start rule.
    pub async fn evaluate_bootstrap(&mut self) -> ScaleDecision {
        let Some((depth, size)) = self.observe().await else {
            return ScaleDecision::NoChange;
        };
        let decision = self.policy.bootstrap(depth, size.live);
        self.apply(decision, depth, size).await
    }

    /// Apply the backlog-per-member rule.
    pub async fn evaluate_backlog(&mut self) -> ScaleDecision {
        let Some((depth, size)) = self.observe().await else {
            return ScaleDecision::NoChange;
        };
        let decision = self.policy.backlog(depth, size.live);
        self.apply(decision, depth, size).await
    }

    /// Bootstrap when the group is empty, backlog rule otherwise.
    pub async fn evaluate(&mut self) -> ScaleDecision {
        let Some((depth, size)) = self.observe().await else {
            return ScaleDecision::NoChange;
        };
        let decision = if size.live == 0 {
            self.policy.bootstrap(depth, size.live)
        } else {
            self.policy.backlog(depth, size.live)
        };
        self.apply(decision, depth, size).await
    }

    /// Evaluate if the cooldown has elapsed, then restart the cooldown
    /// whatever the outcome. Returns `None` while cooling down.
    pub async fn evaluate_if_due(&mut self) -> Option<ScaleDecision> {
        if !self.cooldown_elapsed() {
            return None;
        }
        let decision = self.evaluate().await;
        self.reset_cooldown();
        Some(decision)
    }

    async fn observe(&self) -> Option<(u64, GroupSize)> {
        let depth = match self.queue_depth().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to read queue depth, skipping scaling");
                return None;
            }
        };
        let size = match self.member_count().await {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "failed to read group size, skipping scaling");
                return None;
            }
        };
        Some((depth, size))
    }

    /// Request `decision`'s target unless the group's desired capacity
    /// already moves past it in the same direction.
    async fn apply(&mut self, decision: ScaleDecision, depth: u64, size: GroupSize) -> ScaleDecision {
        let members = size.live;
        let ScaleDecision::ScaleTo(target) = decision else {
            debug!(depth, members, "no scaling change");
            return decision;
        };

        let covered = if target > members {
            target <= size.desired
        } else {
            target >= size.desired
        };
        if covered {
            debug!(depth, members, desired = size.desired, target, "desired capacity already covers the change");
            return ScaleDecision::NoChange;
        }

        match self.request_capacity(target).await {
            Ok(()) => {
                info!(
                    depth,
                    from = members,
                    to = target,
                    threshold = self.policy.backlog_per_member_threshold,
                    "capacity change requested"
                );
                decision
            }
            Err(e) => {
                warn!(target, error = %e, "capacity change failed");
                ScaleDecision::NoChange
            }
        }
    }
}
