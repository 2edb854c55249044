//! Metadata client errors.

use backlog_core::ServiceError;
use backlog_http::HttpError;
use thiserror::Error;

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    /// The metadata endpoint could not be reached.
    #[error("metadata endpoint unavailable: {0}")]
    Unavailable(#[from] HttpError),

    /// The endpoint answered with an unexpected status.
    #[error("metadata endpoint returned {status} for {path}")]
    Status { path: String, status: u16 },

    /// A key the caller requires is absent.
    #[error("metadata key not found: {0}")]
    NotFound(String),

    /// Releasing the lifecycle hook failed.
    #[error("lifecycle completion failed: {0}")]
    Lifecycle(#[from] ServiceError),
}
