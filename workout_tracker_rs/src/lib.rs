//! GPS workout tracking engine.
//!
//! Raw fixes flow validator -> Kalman filter -> accumulator -> splits inside
//! [`SessionController`]. A [`BackgroundTaskBridge`] accrues distance while the
//! app is suspended and [`ReconciliationSync`] merges the two through the
//! key-value store.

pub mod accumulator;
pub mod background;
pub mod clock;
pub mod config;
pub mod error;
pub mod filters;
pub mod provider;
pub mod reconcile;
pub mod records;
pub mod recovery;
pub mod session;
pub mod signal;
pub mod splits;
pub mod storage;
pub mod types;
pub mod validator;


pub use accumulator::DistanceAccumulator;
pub use background::{BackgroundTaskBridge, BridgeOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use error::{TrackResult, TrackingError};
pub use filters::KalmanPositionFilter;
pub use provider::{LocationProvider, SimulatedLocationProvider};
pub use reconcile::{reconciliation_task, ReconciliationSync};
pub use recovery::RecoveryChoice;
pub use session::{SessionController, TrackerState, TrackingEvent};
pub use splits::SplitTracker;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use types::{ActivityKind, LocationSample, SignalStrength, Split, TrackingSession};
pub use validator::{RejectReason, SampleValidator, Validation};
