use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use jni::objects::GlobalRef;
use jni::JavaVM;
use workout_tracker_rs::provider::{BackgroundTaskOptions, LocationProvider, PermissionStatus};
use workout_tracker_rs::{LocationSample, TrackResult, TrackingError};

/// Build a sample from the values Kotlin passes. NaN or negative marks a
/// missing optional field.
pub fn sample_from_java(
    latitude: f64,
    longitude: f64,
    altitude: f64,
    accuracy: f64,
    speed: f64,
    timestamp_ms: i64,
) -> LocationSample {
    let optional = |v: f64| if v.is_finite() && v >= 0.0 { Some(v) } else { None };
    LocationSample {
        latitude,
        longitude,
        altitude: if altitude.is_finite() { Some(altitude) } else { None },
        timestamp_ms,
        horizontal_accuracy: optional(accuracy),
        reported_speed: optional(speed),
    }
}

pub fn permission_from_code(code: i32) -> PermissionStatus {
    match code {
        1 => PermissionStatus::Granted,
        2 => PermissionStatus::Denied,
        _ => PermissionStatus::Undetermined,
    }
}

/// Calls from Rust into the Kotlin service.
pub trait PlatformHooks: Send {
    /// Show the system permission prompt; the answer comes back through
    /// [`LocationReceiver::permission_result`].
    fn permission_requested(&self) -> TrackResult<()>;
    fn register_background(&self, options: &BackgroundTaskOptions) -> TrackResult<()>;
    fn unregister_background(&self) -> TrackResult<()>;
    fn set_wake_lock(&self, held: bool) -> TrackResult<()>;
}

/// Hooks backed by a Kotlin callback object.
pub struct JavaCallbacks {
    vm: JavaVM,
    target: GlobalRef,
}

impl JavaCallbacks {
    pub fn new(vm: JavaVM, target: GlobalRef) -> Self {
        Self { vm, target }
    }

    fn call(&self, method: &str, sig: &str, arg: Option<&str>) -> TrackResult<()> {
        let mut env = self
            .vm
            .attach_current_thread()
            .map_err(|e| TrackingError::Provider(e.to_string()))?;
        let result = match arg {
            Some(text) => {
                let jtext = env
                    .new_string(text)
                    .map_err(|e| TrackingError::Provider(e.to_string()))?;
                env.call_method(self.target.as_obj(), method, sig, &[(&jtext).into()])
            }
            None => env.call_method(self.target.as_obj(), method, sig, &[]),
        };
        result
            .map(|_| ())
            .map_err(|e| TrackingError::Provider(format!("{}: {}", method, e)))
    }
}

impl PlatformHooks for JavaCallbacks {
    fn permission_requested(&self) -> TrackResult<()> {
        self.call("onPermissionRequested", "()V", None)
    }

    fn register_background(&self, options: &BackgroundTaskOptions) -> TrackResult<()> {
        let json = serde_json::to_string(options)?;
        self.call("onRegisterBackground", "(Ljava/lang/String;)V", Some(&json))
    }

    fn unregister_background(&self) -> TrackResult<()> {
        self.call("onUnregisterBackground", "()V", None)
    }

    fn set_wake_lock(&self, held: bool) -> TrackResult<()> {
        let method = if held { "onAcquireWakeLock" } else { "onReleaseWakeLock" };
        self.call(method, "()V", None)
    }
}

struct ReceiverState {
    permission: PermissionStatus,
    pending_permission: Vec<Sender<bool>>,
    foreground: Option<Sender<LocationSample>>,
    background: Option<BackgroundTaskOptions>,
    dropped_samples: u64,
}

/// Shared inbox for fixes and permission answers coming from Kotlin.
/// Usable without the tracker lock, so a blocked permission wait can
/// still receive its answer.
#[derive(Clone)]
pub struct LocationReceiver {
    state: Arc<Mutex<ReceiverState>>,
}

impl Default for LocationReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationReceiver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReceiverState {
                permission: PermissionStatus::Undetermined,
                pending_permission: Vec::new(),
                foreground: None,
                background: None,
                dropped_samples: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReceiverState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a foreground fix. False when nobody is subscribed or the queue is full.
    pub fn push(&self, sample: LocationSample) -> bool {
        let mut state = self.lock();
        let Some(sender) = state.foreground.as_ref() else {
            return false;
        };
        match sender.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                state.dropped_samples += 1;
                log::warn!("location queue full, dropped {} fixes", state.dropped_samples);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                state.foreground = None;
                false
            }
        }
    }

    pub fn set_permission_status(&self, status: PermissionStatus) {
        self.lock().permission = status;
    }

    /// Answer every outstanding permission request.
    pub fn permission_result(&self, granted: bool) {
        let mut state = self.lock();
        state.permission = if granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        for waiter in state.pending_permission.drain(..) {
            // The requester may have timed out already
            let _ = waiter.try_send(granted);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().foreground.is_some()
    }

    pub fn background_registration(&self) -> Option<BackgroundTaskOptions> {
        self.lock().background.clone()
    }
}

/// [`LocationProvider`] for the Android service.
pub struct JniLocationProvider {
    receiver: LocationReceiver,
    hooks: Box<dyn PlatformHooks>,
}

impl JniLocationProvider {
    pub fn new(receiver: LocationReceiver, hooks: Box<dyn PlatformHooks>) -> Self {
        Self { receiver, hooks }
    }
}

impl LocationProvider for JniLocationProvider {
    fn permission_status(&self) -> PermissionStatus {
        self.receiver.lock().permission
    }

    fn request_permission(&mut self) -> TrackResult<Receiver<bool>> {
        let (tx, rx) = bounded(1);
        self.receiver.lock().pending_permission.push(tx);
        self.hooks.permission_requested()?;
        Ok(rx)
    }

    fn subscribe(&mut self, capacity: usize) -> TrackResult<Receiver<LocationSample>> {
        let (tx, rx) = bounded(capacity.max(1));
        self.receiver.lock().foreground = Some(tx);
        Ok(rx)
    }

    fn unsubscribe(&mut self) {
        self.receiver.lock().foreground = None;
    }

    fn register_background(&mut self, options: &BackgroundTaskOptions) -> TrackResult<()> {
        self.hooks.register_background(options)?;
        self.receiver.lock().background = Some(options.clone());
        Ok(())
    }

    fn unregister_background(&mut self) -> TrackResult<()> {
        let result = self.hooks.unregister_background();
        if result.is_ok() {
            self.receiver.lock().background = None;
        }
        result
    }

    fn acquire_wake_lock(&mut self) -> TrackResult<()> {
        self.hooks.set_wake_lock(true)
    }

    fn release_wake_lock(&mut self) {
        if let Err(e) = self.hooks.set_wake_lock(false) {
            log::warn!("wake lock release failed: {}", e);
        }
    }
}
