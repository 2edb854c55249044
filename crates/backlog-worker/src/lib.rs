//! backlog-worker — the per-instance control loop.
//!
//! One worker pulls one job at a time from the shared queue, runs it on
//! the local execution backend, acknowledges it on success, nudges the
//! group size between jobs, and drains when the group picks this
//! instance for termination.
//!
//! ```text
//!   Connecting ──ok──▶ Ready ──▶ Polling ◀──┐
//!     │  ▲                         │  │     │ job done / failed
//!     │  └──── channel lost ───────┘  ├─────┘
//!     │                               │ selected for termination
//!     │   selected for termination    ▼
//!     └─────────────────────────▶ Draining ──▶ Terminated
//! ```
//!
//! A shutdown signal stops the loop at the next iteration boundary from
//! any state.
//!
//! [`submit`] is the producer side: it enqueues a job and starts the
//! first member of an empty group.

pub mod notify;
pub mod runner;
pub mod submit;
pub mod worker;

pub use notify::WebhookNotifier;
pub use runner::{BackendRunner, JobOutcome, JobRunner};
pub use submit::{Submission, submit};
pub use worker::{ExitReason, Step, Worker, WorkerSettings, WorkerState, WorkerStats};
