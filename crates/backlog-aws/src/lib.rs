//! backlog-aws — the hosted queue and scaling group behind backlogd.
//!
//! Both adapters sit on the AWS SDK clients built from one shared
//! [`SdkConfig`](aws_config::SdkConfig). Credentials come from the SDK's
//! default provider chain (environment, profile, instance role).
//!
//! ```text
//! load_config(region, endpoint) ─▶ SdkConfig ─┬─▶ aws_sdk_sqs::Client ─────────▶ SqsQueue
//!                                              └─▶ aws_sdk_autoscaling::Client ─▶ AutoScalingGroup
//! ```

pub mod autoscaling;
pub mod error;
pub mod sqs;

use aws_config::{BehaviorVersion, Region, SdkConfig};

pub use autoscaling::AutoScalingGroup;
pub use error::{AwsError, AwsResult};
pub use sqs::SqsQueue;

/// Shared SDK configuration for `region`. `endpoint_url` points every
/// client at a local emulator instead of the regional endpoints.
pub async fn load_config(region: &str, endpoint_url: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
    if let Some(url) = endpoint_url {
        loader = loader.endpoint_url(url);
    }
    loader.load().await
}
