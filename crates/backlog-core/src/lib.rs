//! backlog-core — shared vocabulary for the backlogd crates.
//!
//! Holds the job and queue-message types, the boundary traits for the
//! external services the worker talks to (queue, scaling group,
//! notification channel), the daemon configuration, and in-memory
//! implementations of the queue and group used for local runs and tests.

pub mod boundary;
pub mod config;
pub mod memory;
pub mod types;

pub use boundary::{
    GroupSize, Notifier, NoopNotifier, ReceiveOptions, ScalingGroup, ServiceError, ServiceResult,
    WorkQueue,
};
pub use config::{ConfigError, WorkerConfig};
pub use memory::{MemoryGroup, MemoryQueue};
pub use types::*;
