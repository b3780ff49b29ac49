//! Error types for the quota service.

use std::time::Duration;

use thiserror::Error;

use crate::quota::WindowName;

/// Main error type for quota operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller supplied an empty or malformed user id
    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    /// Counter store errors that could not be recovered locally
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Session store errors
    #[error("Session error: {0}")]
    Session(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for quota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Errors raised by a counter backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (refused, reset, dropped).
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The store did not answer within the configured timeout.
    #[error("store timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with an error for a command.
    #[error("store command failed: {0}")]
    Command(String),

    /// The store answered with something we cannot interpret.
    #[error("unexpected store reply: {0}")]
    Protocol(String),

    /// A batch was only partly confirmed by the store.
    #[error("charge for the {window} window was not confirmed: {detail}")]
    PartialWrite { window: WindowName, detail: String },
}

impl StoreError {
    /// Whether this error means the store is unavailable, as opposed to a
    /// reply we could not use.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unreachable(_) | StoreError::Timeout(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || matches!(err.kind(), redis::ErrorKind::BusyLoadingError)
        {
            StoreError::Unreachable(err.to_string())
        } else if matches!(err.kind(), redis::ErrorKind::TypeError) {
            StoreError::Protocol(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(StoreError::Unreachable("refused".into()).is_connectivity());
        assert!(StoreError::Timeout(Duration::from_millis(250)).is_connectivity());
        assert!(!StoreError::Command("NOSCRIPT".into()).is_connectivity());
        assert!(!StoreError::PartialWrite {
            window: WindowName::Hour,
            detail: "short reply".into(),
        }
        .is_connectivity());
    }

    #[test]
    fn test_redis_io_error_is_unreachable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: StoreError = redis::RedisError::from(io).into();
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_redis_response_error_is_command() {
        let err: StoreError =
            redis::RedisError::from((redis::ErrorKind::ResponseError, "ERR unknown command"))
                .into();
        assert!(matches!(err, StoreError::Command(_)));
    }

    #[test]
    fn test_partial_write_message_names_window() {
        let err = StoreError::PartialWrite {
            window: WindowName::Day,
            detail: "exec returned 6 replies".into(),
        };
        assert!(err.to_string().contains("day"));
    }
}
