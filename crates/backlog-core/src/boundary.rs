//! Boundaries to the external services the worker depends on.
//!
//! Every operation here is narrow and idempotent: deleting an
//! already-deleted message or requesting a capacity the group already has
//! must be harmless. Callers never assume exclusive access.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::QueueMessage;

/// Result type alias for boundary calls.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by an external service adapter.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service could not be reached.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service answered with an error.
    #[error("service rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    /// The response could not be decoded.
    #[error("malformed service response: {0}")]
    Decode(String),

}

/// Receive options for a single long-poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on messages returned.
    pub max_messages: u32,
    /// Long-poll wait.
    pub wait: Duration,
    /// Per-receive visibility timeout override. `None` keeps the queue's
    /// own default.
    pub visibility_timeout: Option<Duration>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait: Duration::from_secs(20),
            visibility_timeout: None,
        }
    }
}

/// The shared work queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Long-poll for up to `opts.max_messages` messages.
    async fn receive(&self, opts: ReceiveOptions) -> ServiceResult<Vec<QueueMessage>>;

    /// Acknowledge (delete) a message by its receipt.
    async fn delete(&self, receipt: &str) -> ServiceResult<()>;

    /// Approximate number of visible messages. Eventually consistent.
    async fn approximate_depth(&self) -> ServiceResult<u64>;

    /// Enqueue a job body and return the new message's id.
    async fn send(&self, body: &str) -> ServiceResult<String>;
}

/// Size of the scaling group as last described.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSize {
    /// Members in service or on their way in.
    pub live: u32,
    /// Capacity the group is converging to.
    pub desired: u32,
}

impl GroupSize {
    /// A group whose live count already matches its desired capacity.
    pub fn settled(members: u32) -> Self {
        Self {
            live: members,
            desired: members,
        }
    }
}

/// The scaling group this worker is a member of.
#[async_trait]
pub trait ScalingGroup: Send + Sync {
    /// Live member count and desired capacity.
    async fn describe_members(&self) -> ServiceResult<GroupSize>;

    /// Ask the group to converge to `desired` members.
    async fn set_desired_count(&self, desired: u32) -> ServiceResult<()>;

    /// Release the termination lifecycle hook held for `instance_id`.
    async fn complete_lifecycle(&self, instance_id: &str) -> ServiceResult<()>;
}

/// Best-effort alert channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message`. Implementations log failures and never return them.
    async fn notify(&self, message: &str);
}

/// Notifier used when no alert channel is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, message: &str) {
        tracing::debug!(notification = message, "notification dropped, no channel configured");
    }
}
