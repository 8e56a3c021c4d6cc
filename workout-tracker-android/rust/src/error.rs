use jni::JNIEnv;
use thiserror::Error;
use workout_tracker_rs::TrackingError;

/// Errors surfaced to Kotlin
#[derive(Error, Debug)]
pub enum WorkoutTrackerError {
    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("Tracker not initialized")]
    NotInitialized,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("JNI error: {0}")]
    JniError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<jni::errors::Error> for WorkoutTrackerError {
    fn from(e: jni::errors::Error) -> Self {
        WorkoutTrackerError::JniError(e.to_string())
    }
}

impl From<serde_json::Error> for WorkoutTrackerError {
    fn from(e: serde_json::Error) -> Self {
        WorkoutTrackerError::InvalidParameters(e.to_string())
    }
}

/// Result type for JNI operations
pub type JResult<T> = Result<T, WorkoutTrackerError>;

/// Java exception class for an error
pub fn exception_class(error: &WorkoutTrackerError) -> &'static str {
    match error {
        WorkoutTrackerError::Tracking(inner) => match inner {
            TrackingError::PermissionDenied | TrackingError::PermissionTimeout(_) => {
                "java/lang/SecurityException"
            }
            TrackingError::AlreadyTracking
            | TrackingError::NotTracking
            | TrackingError::InvalidState(_)
            | TrackingError::NoRecoverySnapshot => "java/lang/IllegalStateException",
            TrackingError::Provider(_) | TrackingError::Storage(_) | TrackingError::Io(_) => {
                "java/io/IOException"
            }
            TrackingError::Serialization(_) => "java/lang/RuntimeException",
        },
        WorkoutTrackerError::NotInitialized => "java/lang/IllegalStateException",
        WorkoutTrackerError::InvalidParameters(_) => "java/lang/IllegalArgumentException",
        WorkoutTrackerError::JniError(_) | WorkoutTrackerError::Internal(_) => {
            "java/lang/RuntimeException"
        }
    }
}

/// Throw Java exception from Rust error
pub fn throw_java_exception(env: &mut JNIEnv, error: &WorkoutTrackerError) -> JResult<()> {
    let message = error.to_string();
    env.throw_new(exception_class(error), message)
        .map_err(|_| WorkoutTrackerError::JniError("Failed to throw exception".to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exception_mapping() {
        let denied = WorkoutTrackerError::from(TrackingError::PermissionTimeout(Duration::from_secs(10)));
        assert_eq!(exception_class(&denied), "java/lang/SecurityException");
        let busy = WorkoutTrackerError::from(TrackingError::AlreadyTracking);
        assert_eq!(exception_class(&busy), "java/lang/IllegalStateException");
        let io = WorkoutTrackerError::from(TrackingError::Storage("disk full".to_string()));
        assert_eq!(exception_class(&io), "java/io/IOException");
        assert_eq!(
            exception_class(&WorkoutTrackerError::InvalidParameters("lat".to_string())),
            "java/lang/IllegalArgumentException"
        );
    }

    #[test]
    fn test_message_passes_through() {
        let e = WorkoutTrackerError::from(TrackingError::NotTracking);
        assert_eq!(e.to_string(), "Session not running");
    }
}
