use std::time::Duration;
use thiserror::Error;

/// Tracking engine error types
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location permission request timed out after {0:?}")]
    PermissionTimeout(Duration),

    #[error("Session already running")]
    AlreadyTracking,

    #[error("Session not running")]
    NotTracking,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Location provider error: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No recovery snapshot available")]
    NoRecoverySnapshot,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackingError {
    /// Whether the caller can retry after the user changes settings or signal returns.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackingError::PermissionDenied
                | TrackingError::PermissionTimeout(_)
                | TrackingError::Provider(_)
                | TrackingError::Storage(_)
                | TrackingError::Io(_)
        )
    }
}

/// Result type for tracking operations
pub type TrackResult<T> = Result<T, TrackingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(TrackingError::AlreadyTracking.to_string(), "Session already running");
        let e = TrackingError::PermissionTimeout(Duration::from_secs(10));
        assert!(e.to_string().contains("10s"));
    }

    #[test]
    fn test_retryable() {
        assert!(TrackingError::PermissionDenied.is_retryable());
        assert!(!TrackingError::NotTracking.is_retryable());
    }
}
