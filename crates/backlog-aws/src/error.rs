//! AWS adapter errors.

use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use backlog_core::ServiceError;
use thiserror::Error;

pub type AwsResult<T> = Result<T, AwsError>;

#[derive(Debug, Error)]
pub enum AwsError {
    /// The service answered with an error.
    #[error("{operation} failed ({code}): {message}")]
    Service {
        operation: &'static str,
        code: String,
        message: String,
    },

    /// The request never got an answer (connect failure, timeout).
    #[error("{operation} could not reach the service: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },

    #[error("malformed {operation} response: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },
}

impl AwsError {
    /// Service error code, e.g. `QueueDoesNotExist`.
    pub fn code(&self) -> Option<&str> {
        match self {
            AwsError::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Classify an SDK failure of `operation`.
    pub(crate) fn from_sdk<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::ServiceError(ctx) => AwsError::Service {
                operation,
                code: ctx.err().code().unwrap_or("Unknown").to_string(),
                message: ctx.err().message().unwrap_or_default().to_string(),
            },
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => AwsError::Unavailable {
                operation,
                reason: DisplayErrorContext(&err).to_string(),
            },
            _ => AwsError::Decode {
                operation,
                reason: DisplayErrorContext(&err).to_string(),
            },
        }
    }
}

impl From<AwsError> for ServiceError {
    fn from(e: AwsError) -> Self {
        match e {
            AwsError::Service { code, message, .. } => ServiceError::Rejected { code, message },
            e @ AwsError::Unavailable { .. } => ServiceError::Unavailable(e.to_string()),
            e @ AwsError::Decode { .. } => ServiceError::Decode(e.to_string()),
        }
    }
}
