//! backlog-metadata — capacity metadata client.
//!
//! Talks to the link-local instance metadata endpoint with session
//! tokens and answers one question for the worker loop: is this instance
//! being terminated by its scaling group?
//!
//! # Rate limits
//!
//! ```text
//! get_token()            cached until shortly before the token TTL runs out
//! is_self_terminating()  at most one lifecycle-state read per check_interval
//! ```
//!
//! The worker calls the termination check once per queue poll, so both
//! limits are what keep the metadata endpoint from being hammered.

pub mod client;
pub mod error;
pub mod termination;

pub use client::MetadataClient;
pub use error::{MetadataError, MetadataResult};
pub use termination::{NeverTerminating, TerminationCheck, TerminationWatch, TERMINATING_STATES};
