//! backlog-http — the HTTP client every backlogd component shares.
//!
//! One connection per request over hyper's HTTP/1.1 connection API,
//! with rustls for `https` targets. Requests are small and infrequent
//! (metadata reads, queue calls every few seconds, artifact downloads),
//! so there is no pooling.
//!
//! # Errors
//!
//! [`HttpError::Connect`] is kept apart from failures after the socket
//! is up, so callers can tell "nothing is listening yet" from "the peer
//! went away mid-request".

pub mod client;

pub use client::{HttpClient, HttpError, HttpRequest, HttpResponse};
