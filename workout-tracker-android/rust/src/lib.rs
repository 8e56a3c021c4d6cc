// Workout Tracker Android JNI Library
// Exposes the Rust workout tracking engine to Kotlin via JNI

pub mod android_jni;
pub mod error;
pub mod location_receiver;
pub mod tracker;

pub use error::{JResult, WorkoutTrackerError};
pub use location_receiver::{JniLocationProvider, LocationReceiver, PlatformHooks};
pub use tracker::TrackerService;
