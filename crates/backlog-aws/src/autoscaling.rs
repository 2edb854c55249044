//! The worker's own Auto Scaling group.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_autoscaling::Client;
use aws_sdk_autoscaling::types::{Instance, LifecycleState};
use backlog_core::{GroupSize, ScalingGroup, ServiceResult};
use tracing::{debug, info};

use crate::error::AwsError;

/// The group this worker belongs to.
pub struct AutoScalingGroup {
    client: Client,
    name: String,
    lifecycle_hook: Option<String>,
}

impl AutoScalingGroup {
    pub fn new(config: &SdkConfig, name: impl Into<String>, lifecycle_hook: Option<String>) -> Self {
        Self::with_client(Client::new(config), name, lifecycle_hook)
    }

    pub fn with_client(client: Client, name: impl Into<String>, lifecycle_hook: Option<String>) -> Self {
        Self {
            client,
            name: name.into(),
            lifecycle_hook,
        }
    }
}

/// Lifecycle states of instances on their way out.
fn is_leaving(state: &str) -> bool {
    state.starts_with("Terminating") || state == "Terminated"
}

/// Lifecycle state name, empty when the service left it out. `From`
/// accepts both the required and the optional accessor shape.
fn lifecycle_state(instance: &Instance) -> &str {
    Option::<&LifecycleState>::from(instance.lifecycle_state()).map_or("", |s| s.as_str())
}

/// Size of a described group: members not being terminated, and the
/// desired capacity it converges to.
pub fn group_size<'a>(desired: Option<i32>, states: impl IntoIterator<Item = &'a str>) -> GroupSize {
    let live = states.into_iter().filter(|s| !is_leaving(s)).count() as u32;
    GroupSize {
        live,
        desired: desired.map_or(live, |d| d.max(0) as u32),
    }
}

#[async_trait]
impl ScalingGroup for AutoScalingGroup {
    async fn describe_members(&self) -> ServiceResult<GroupSize> {
        let out = self
            .client
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&self.name)
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("DescribeAutoScalingGroups", e))?;

        // The name filter is applied server-side.
        let group = out.auto_scaling_groups().first().ok_or_else(|| AwsError::Service {
            operation: "DescribeAutoScalingGroups",
            code: "GroupNotFound".to_string(),
            message: format!("auto scaling group {} does not exist", self.name),
        })?;

        let size = group_size(
            Option::<i32>::from(group.desired_capacity()),
            group.instances().iter().map(lifecycle_state),
        );
        debug!(
            group = %self.name,
            desired = size.desired,
            instances = group.instances().len(),
            live = size.live,
            leaving = ?group
                .instances()
                .iter()
                .filter(|i| is_leaving(lifecycle_state(i)))
                .filter_map(|i| Option::<&str>::from(i.instance_id()))
                .collect::<Vec<_>>(),
            "group described"
        );
        Ok(size)
    }

    async fn set_desired_count(&self, desired: u32) -> ServiceResult<()> {
        let capacity = i32::try_from(desired).map_err(|_| AwsError::Service {
            operation: "SetDesiredCapacity",
            code: "ValidationError".to_string(),
            message: format!("desired capacity {desired} is out of range"),
        })?;
        self.client
            .set_desired_capacity()
            .auto_scaling_group_name(&self.name)
            .desired_capacity(capacity)
            .honor_cooldown(false)
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("SetDesiredCapacity", e))?;
        info!(group = %self.name, desired, "desired capacity set");
        Ok(())
    }

    async fn complete_lifecycle(&self, instance_id: &str) -> ServiceResult<()> {
        let Some(hook) = &self.lifecycle_hook else {
            info!(group = %self.name, instance_id, "no lifecycle hook configured, nothing to release");
            return Ok(());
        };
        self.client
            .complete_lifecycle_action()
            .auto_scaling_group_name(&self.name)
            .lifecycle_hook_name(hook)
            .instance_id(instance_id)
            .lifecycle_action_result("CONTINUE")
            .send()
            .await
            .map_err(|e| AwsError::from_sdk("CompleteLifecycleAction", e))?;
        info!(group = %self.name, hook = %hook, instance_id, "lifecycle action completed");
        Ok(())
    }
}
