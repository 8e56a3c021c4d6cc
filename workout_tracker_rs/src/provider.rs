//! Platform location services as seen by the controller.
//!
//! The controller never branches on platform: Android supplies a JNI-backed
//! implementation, replay and tests use [`SimulatedLocationProvider`].

use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{TrackResult, TrackingError};
use crate::types::{ActivityKind, LocationSample};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

/// Background registration parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTaskOptions {
    pub session_id: String,
    pub activity_kind: ActivityKind,
    pub min_distance_m: f64,
    pub min_interval_secs: f64,
}

impl BackgroundTaskOptions {
    /// Task name the OS keys the registration by.
    pub fn task_name(&self) -> String {
        format!("workout-location-{}", self.activity_kind.as_str())
    }
}

pub trait LocationProvider: Send {
    fn permission_status(&self) -> PermissionStatus;

    /// Start a permission request; the answer arrives on the channel.
    fn request_permission(&mut self) -> TrackResult<Receiver<bool>>;

    /// Foreground subscription. Replaces any previous subscription.
    fn subscribe(&mut self, capacity: usize) -> TrackResult<Receiver<LocationSample>>;

    fn unsubscribe(&mut self);

    fn register_background(&mut self, options: &BackgroundTaskOptions) -> TrackResult<()>;

    fn unregister_background(&mut self) -> TrackResult<()>;

    fn acquire_wake_lock(&mut self) -> TrackResult<()>;

    fn release_wake_lock(&mut self);
}

#[derive(Default)]
struct SimulatedState {
    permission: Option<PermissionStatus>,
    /// Answer given to a permission request; `None` never answers
    permission_answer: Option<bool>,
    pending_permission: Vec<Sender<bool>>,
    foreground: Option<Sender<LocationSample>>,
    background: Option<BackgroundTaskOptions>,
    wake_lock_held: bool,
    fail_unregister: bool,
    dropped_samples: u64,
}

/// In-process provider for replay and tests. Clones share state so a test
/// can keep a handle after moving one into the controller.
#[derive(Clone, Default)]
pub struct SimulatedLocationProvider {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedLocationProvider {
    /// Provider with permission already granted.
    pub fn granted() -> Self {
        let provider = Self::default();
        provider.set_permission(PermissionStatus::Granted, Some(true));
        provider
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        // Poisoning only happens if a test panicked mid-call
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_permission(&self, status: PermissionStatus, answer: Option<bool>) {
        let mut state = self.lock();
        state.permission = Some(status);
        state.permission_answer = answer;
    }

    pub fn set_fail_unregister(&self, fail: bool) {
        self.lock().fail_unregister = fail;
    }

    /// Deliver a fix to the foreground subscriber, if any.
    pub fn emit(&self, sample: LocationSample) -> bool {
        let mut state = self.lock();
        let Some(sender) = state.foreground.as_ref() else {
            return false;
        };
        match sender.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                state.dropped_samples += 1;
                log::warn!("foreground channel full, dropping fix");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                state.foreground = None;
                false
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().foreground.is_some()
    }

    pub fn background_registration(&self) -> Option<BackgroundTaskOptions> {
        self.lock().background.clone()
    }

    pub fn wake_lock_held(&self) -> bool {
        self.lock().wake_lock_held
    }

    pub fn dropped_samples(&self) -> u64 {
        self.lock().dropped_samples
    }
}

impl LocationProvider for SimulatedLocationProvider {
    fn permission_status(&self) -> PermissionStatus {
        self.lock().permission.unwrap_or(PermissionStatus::Undetermined)
    }

    fn request_permission(&mut self) -> TrackResult<Receiver<bool>> {
        let (tx, rx) = bounded(1);
        let mut state = self.lock();
        match state.permission_answer {
            Some(granted) => {
                state.permission = Some(if granted {
                    PermissionStatus::Granted
                } else {
                    PermissionStatus::Denied
                });
                // Receiver is alive; a full channel is impossible here
                let _ = tx.send(granted);
            }
            None => state.pending_permission.push(tx),
        }
        Ok(rx)
    }

    fn subscribe(&mut self, capacity: usize) -> TrackResult<Receiver<LocationSample>> {
        let (tx, rx) = bounded(capacity.max(1));
        self.lock().foreground = Some(tx);
        Ok(rx)
    }

    fn unsubscribe(&mut self) {
        self.lock().foreground = None;
    }

    fn register_background(&mut self, options: &BackgroundTaskOptions) -> TrackResult<()> {
        log::debug!("registering background task {}", options.task_name());
        self.lock().background = Some(options.clone());
        Ok(())
    }

    fn unregister_background(&mut self) -> TrackResult<()> {
        let mut state = self.lock();
        if state.fail_unregister {
            return Err(TrackingError::Provider("background task still running".to_string()));
        }
        state.background = None;
        Ok(())
    }

    fn acquire_wake_lock(&mut self) -> TrackResult<()> {
        self.lock().wake_lock_held = true;
        Ok(())
    }

    fn release_wake_lock(&mut self) {
        self.lock().wake_lock_held = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_emit_requires_subscription() {
        let mut provider = SimulatedLocationProvider::granted();
        assert!(!provider.emit(LocationSample::new(0.0, 0.0, 0)));
        let rx = provider.subscribe(4).unwrap();
        assert!(provider.emit(LocationSample::new(0.0, 0.0, 1)));
        assert_eq!(rx.try_recv().unwrap().timestamp_ms, 1);
        provider.unsubscribe();
        assert!(!provider.is_subscribed());
    }

    #[test]
    fn test_full_channel_drops() {
        let mut provider = SimulatedLocationProvider::granted();
        let _rx = provider.subscribe(1).unwrap();
        assert!(provider.emit(LocationSample::new(0.0, 0.0, 1)));
        assert!(!provider.emit(LocationSample::new(0.0, 0.0, 2)));
        assert_eq!(provider.dropped_samples(), 1);
    }

    #[test]
    fn test_unanswered_permission_times_out() {
        let mut provider = SimulatedLocationProvider::default();
        provider.set_permission(PermissionStatus::Undetermined, None);
        let rx = provider.request_permission().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = SimulatedLocationProvider::granted();
        let mut owned = handle.clone();
        owned.acquire_wake_lock().unwrap();
        assert!(handle.wake_lock_held());
        owned.release_wake_lock();
        assert!(!handle.wake_lock_held());
    }
}
