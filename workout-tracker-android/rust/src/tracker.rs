use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use workout_tracker_rs::storage::KeyValueStore;
use workout_tracker_rs::{
    ActivityKind, BackgroundTaskBridge, BridgeOutcome, FileStore, LocationSample, RecoveryChoice,
    SessionController, SystemClock, TrackerConfig, TrackerState, TrackingEvent,
};

use crate::error::{JResult, WorkoutTrackerError};
use crate::location_receiver::{JniLocationProvider, LocationReceiver, PlatformHooks};

/// Subdirectory of the app's files dir holding tracker state
pub const STORE_DIR: &str = "workout_tracker";

pub fn parse_config(json: Option<&str>) -> JResult<TrackerConfig> {
    match json.map(str::trim).filter(|s| !s.is_empty()) {
        Some(json) => Ok(TrackerConfig::from_json_str(json)?),
        None => Ok(TrackerConfig::default()),
    }
}

pub fn state_name(state: TrackerState) -> &'static str {
    match state {
        TrackerState::Idle => "IDLE",
        TrackerState::Tracking => "TRACKING",
        TrackerState::Paused => "PAUSED",
    }
}

#[derive(Serialize)]
struct EventBatch<'a> {
    state: &'static str,
    distance_m: f64,
    signal: &'static str,
    events: &'a [TrackingEvent],
}

/// Session controller as hosted by the Android service.
pub struct TrackerService {
    controller: SessionController,
}

impl TrackerService {
    pub fn open(
        files_dir: &Path,
        config: TrackerConfig,
        receiver: LocationReceiver,
        hooks: Box<dyn PlatformHooks>,
    ) -> JResult<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(files_dir.join(STORE_DIR))?);
        Ok(Self::with_store(store, config, receiver, hooks))
    }

    pub fn with_store(
        store: Arc<dyn KeyValueStore>,
        config: TrackerConfig,
        receiver: LocationReceiver,
        hooks: Box<dyn PlatformHooks>,
    ) -> Self {
        let provider = JniLocationProvider::new(receiver, hooks);
        let controller = SessionController::new(config, Box::new(provider), store, Arc::new(SystemClock));
        Self { controller }
    }

    /// Returns true when the background task was registered too.
    pub fn start(&mut self, activity: &str) -> JResult<bool> {
        let kind: ActivityKind = activity.parse().map_err(WorkoutTrackerError::InvalidParameters)?;
        Ok(self.controller.start_tracking(kind)?)
    }

    pub fn pause(&mut self) -> JResult<()> {
        Ok(self.controller.pause_tracking()?)
    }

    pub fn resume(&mut self) -> JResult<()> {
        Ok(self.controller.resume_tracking()?)
    }

    /// Finished session as JSON
    pub fn stop(&mut self) -> JResult<String> {
        let session = self.controller.stop_tracking()?;
        Ok(serde_json::to_string(&session)?)
    }

    pub fn state(&self) -> &'static str {
        state_name(self.controller.state())
    }

    pub fn current_session_json(&self) -> JResult<Option<String>> {
        match self.controller.current_session() {
            Some(session) => Ok(Some(serde_json::to_string(&session)?)),
            None => Ok(None),
        }
    }

    pub fn signal_strength(&self) -> &'static str {
        self.controller.signal_strength().as_str()
    }

    /// [can_start, can_pause, can_resume, can_stop] as 0/1 for the UI
    pub fn available_actions(&self) -> [i32; 4] {
        [
            self.controller.can_start(),
            self.controller.can_pause(),
            self.controller.can_resume(),
            self.controller.can_stop(),
        ]
        .map(i32::from)
    }

    pub fn app_background(&mut self) -> JResult<String> {
        let events = self.controller.on_app_background();
        self.events_json(&events)
    }

    pub fn app_foreground(&mut self) -> JResult<String> {
        let events = self.controller.on_app_foreground();
        self.events_json(&events)
    }

    /// Periodic call from the service: drains queued fixes, watches the
    /// signal and reconciles when due.
    pub fn tick(&mut self) -> JResult<String> {
        let events = self.controller.tick();
        self.events_json(&events)
    }

    pub fn pending_recovery_json(&self) -> JResult<Option<String>> {
        match self.controller.pending_recovery()? {
            Some(record) => Ok(Some(serde_json::to_string(&record)?)),
            None => Ok(None),
        }
    }

    /// Finalized session JSON for `finalize`, nothing otherwise.
    pub fn recover(&mut self, choice: &str) -> JResult<Option<String>> {
        let choice: RecoveryChoice = choice.parse().map_err(WorkoutTrackerError::InvalidParameters)?;
        match self.controller.recover(choice)? {
            Some(session) => Ok(Some(serde_json::to_string(&session)?)),
            None => Ok(None),
        }
    }

    fn events_json(&self, events: &[TrackingEvent]) -> JResult<String> {
        let batch = EventBatch {
            state: self.state(),
            distance_m: self
                .controller
                .current_session()
                .map(|s| s.cumulative_distance_m)
                .unwrap_or(0.0),
            signal: self.signal_strength(),
            events,
        };
        Ok(serde_json::to_string(&batch)?)
    }
}

/// Background task entry point. Runs without a controller, possibly in a
/// fresh process. Returns the number of accepted fixes.
pub fn handle_background_locations(
    files_dir: &Path,
    config: &TrackerConfig,
    samples_json: &str,
) -> JResult<usize> {
    let samples: Vec<LocationSample> = serde_json::from_str(samples_json)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(files_dir.join(STORE_DIR))?);
    let bridge = BackgroundTaskBridge::new(store, config.validator.clone(), config.background.clone());
    match bridge.handle_locations(&samples)? {
        BridgeOutcome::Processed(stats) => Ok(stats.accepted),
        other => {
            log::debug!("background delivery skipped: {:?}", other);
            Ok(0)
        }
    }
}
