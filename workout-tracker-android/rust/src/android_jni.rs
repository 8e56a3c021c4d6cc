use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, Once};

use jni::objects::{JClass, JObject, JString};
use jni::sys::{jboolean, jdouble, jint, jintArray, jlong, jstring, JNI_TRUE};
use jni::JNIEnv;

use crate::error::{throw_java_exception, JResult, WorkoutTrackerError};
use crate::location_receiver::{permission_from_code, sample_from_java, JavaCallbacks, LocationReceiver};
use crate::tracker::{handle_background_locations, parse_config, TrackerService};

/// Object behind the `jlong` handle Kotlin holds.
pub struct NativeTracker {
    /// Fixes and permission answers bypass the service lock
    receiver: LocationReceiver,
    service: Mutex<TrackerService>,
}

impl NativeTracker {
    fn service(&self) -> JResult<MutexGuard<'_, TrackerService>> {
        self.service
            .lock()
            .map_err(|_| WorkoutTrackerError::Internal("Failed to acquire tracker lock".to_string()))
    }
}

static LOGGER: Once = Once::new();

fn init_logging() {
    LOGGER.call_once(|| {
        #[cfg(target_os = "android")]
        {
            if android_log::init("WorkoutTracker").is_err() {
                return;
            }
            log::set_max_level(log::LevelFilter::Info);
        }
    });
}

/// Borrow the tracker behind a handle from `nativeCreate`.
fn tracker_ref<'a>(handle: jlong) -> JResult<&'a NativeTracker> {
    if handle == 0 {
        return Err(WorkoutTrackerError::NotInitialized);
    }
    // SAFETY: non-zero handles come from Box::into_raw in nativeCreate and stay
    // valid until nativeDestroy, which Kotlin calls last.
    Ok(unsafe { &*(handle as *const NativeTracker) })
}

fn with_tracker<T>(handle: jlong, f: impl FnOnce(&mut TrackerService) -> JResult<T>) -> JResult<T> {
    let tracker = tracker_ref(handle)?;
    let mut service = tracker.service()?;
    f(&mut service)
}

/// Null or empty Java strings read as `None`
fn read_string(env: &mut JNIEnv, value: &JString) -> JResult<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    let text: String = env.get_string(value)?.into();
    Ok(Some(text).filter(|s| !s.is_empty()))
}

fn require_string(env: &mut JNIEnv, value: &JString, name: &str) -> JResult<String> {
    read_string(env, value)?.ok_or_else(|| WorkoutTrackerError::InvalidParameters(format!("{} is required", name)))
}

fn int_result(env: &mut JNIEnv, result: JResult<jint>) -> jint {
    match result {
        Ok(value) => value,
        Err(e) => {
            log::warn!("JNI call failed: {}", e);
            let _ = throw_java_exception(env, &e);
            -1
        }
    }
}

/// `Ok(None)` becomes a Java null without an exception.
fn string_result(env: &mut JNIEnv, result: JResult<Option<String>>) -> jstring {
    let text = match result {
        Ok(Some(text)) => text,
        Ok(None) => return std::ptr::null_mut(),
        Err(e) => {
            log::warn!("JNI call failed: {}", e);
            let _ = throw_java_exception(env, &e);
            return std::ptr::null_mut();
        }
    };
    match env.new_string(text) {
        Ok(jstr) => jstr.into_raw(),
        Err(_) => {
            let _ = throw_java_exception(
                env,
                &WorkoutTrackerError::JniError("Failed to create Java string".to_string()),
            );
            std::ptr::null_mut()
        }
    }
}

/// JNI: Create a tracker
/// Parameters: app files dir, config JSON (nullable), callback object
/// Returns: opaque handle, 0 on error (throws Java exception)
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_nativeCreate(
    mut env: JNIEnv,
    _class: JClass,
    files_dir: JString,
    config_json: JString,
    callbacks: JObject,
) -> jlong {
    init_logging();
    match create_impl(&mut env, &files_dir, &config_json, &callbacks) {
        Ok(tracker) => Box::into_raw(Box::new(tracker)) as jlong,
        Err(e) => {
            log::warn!("tracker creation failed: {}", e);
            let _ = throw_java_exception(&mut env, &e);
            0
        }
    }
}

fn create_impl(
    env: &mut JNIEnv,
    files_dir: &JString,
    config_json: &JString,
    callbacks: &JObject,
) -> JResult<NativeTracker> {
    let dir = PathBuf::from(require_string(env, files_dir, "filesDir")?);
    let config = parse_config(read_string(env, config_json)?.as_deref())?;
    if callbacks.is_null() {
        return Err(WorkoutTrackerError::InvalidParameters("callbacks is required".to_string()));
    }
    let hooks = JavaCallbacks::new(env.get_java_vm()?, env.new_global_ref(callbacks)?);
    let receiver = LocationReceiver::new();
    let service = TrackerService::open(&dir, config, receiver.clone(), Box::new(hooks))?;
    log::info!("workout tracker created in {}", dir.display());
    Ok(NativeTracker {
        receiver,
        service: Mutex::new(service),
    })
}

/// JNI: Release a tracker. A live session is stopped first; its snapshot is
/// cleared, so call `stopSession` beforehand to keep the result.
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_nativeDestroy(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if handle == 0 {
        return;
    }
    // SAFETY: see tracker_ref; the handle is not used after this call.
    let tracker = unsafe { Box::from_raw(handle as *mut NativeTracker) };
    if let Ok(mut service) = tracker.service() {
        if service.state() != "IDLE" {
            if let Err(e) = service.stop() {
                log::warn!("stop on destroy failed: {}", e);
            }
        }
    }
    log::info!("workout tracker destroyed");
}

/// JNI: Start a session for the given activity ("running", "walking", "cycling")
/// Returns: 1 with background tracking, 0 foreground only, -1 on error
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_startSession(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    activity: JString,
) -> jint {
    let result = require_string(&mut env, &activity, "activity")
        .and_then(|activity| with_tracker(handle, |t| t.start(&activity)))
        .map(jint::from);
    int_result(&mut env, result)
}

#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_pauseSession(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jint {
    let result = with_tracker(handle, |t| t.pause()).map(|_| 0);
    int_result(&mut env, result)
}

#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_resumeSession(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jint {
    let result = with_tracker(handle, |t| t.resume()).map(|_| 0);
    int_result(&mut env, result)
}

/// JNI: Stop the session
/// Returns: finished session JSON, or null on error (throws Java exception)
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_stopSession(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| t.stop()).map(Some);
    string_result(&mut env, result)
}

/// JNI: "IDLE", "TRACKING" or "PAUSED"
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_getSessionState(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| Ok(Some(t.state().to_string())));
    string_result(&mut env, result)
}

/// JNI: Live session JSON, null when idle
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_getCurrentSessionJson(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| t.current_session_json());
    string_result(&mut env, result)
}

/// JNI: "none", "searching", "weak", "medium" or "strong"
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_getSignalStrength(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| Ok(Some(t.signal_strength().to_string())));
    string_result(&mut env, result)
}

/// JNI: [canStart, canPause, canResume, canStop] as 0/1
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_getAvailableActions(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jintArray {
    match with_tracker(handle, |t| Ok(t.available_actions())) {
        Ok(actions) => match env.new_int_array(4) {
            Ok(arr) => {
                let _ = env.set_int_array_region(&arr, 0, &actions);
                arr.into_raw()
            }
            Err(_) => std::ptr::null_mut(),
        },
        Err(e) => {
            let _ = throw_java_exception(&mut env, &e);
            std::ptr::null_mut()
        }
    }
}

/// JNI: Queue a foreground fix from the fused location provider
/// Parameters: latitude, longitude, altitude (m), accuracy (m), speed (m/s),
/// timestamp (ms since epoch). Pass NaN for unknown values.
/// Returns: 1 if queued, 0 if dropped (no subscription or queue full)
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_pushLocation(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    latitude: jdouble,
    longitude: jdouble,
    altitude: jdouble,
    accuracy: jdouble,
    speed: jdouble,
    timestamp_ms: jlong,
) -> jint {
    let Ok(tracker) = tracker_ref(handle) else {
        return 0;
    };
    let sample = sample_from_java(latitude, longitude, altitude, accuracy, speed, timestamp_ms);
    jint::from(tracker.receiver.push(sample))
}

/// JNI: Current permission state (1 granted, 2 denied, otherwise undetermined)
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_setPermissionStatus(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    status: jint,
) {
    if let Ok(tracker) = tracker_ref(handle) {
        tracker.receiver.set_permission_status(permission_from_code(status));
    }
}

/// JNI: Answer to a prompt raised through `onPermissionRequested`
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_onPermissionResult(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
    granted: jboolean,
) {
    if let Ok(tracker) = tracker_ref(handle) {
        tracker.receiver.permission_result(granted == JNI_TRUE);
    }
}

/// JNI: Activity went to the background; returns an event batch JSON
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_onAppBackground(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| t.app_background()).map(Some);
    string_result(&mut env, result)
}

/// JNI: Activity is visible again; returns an event batch JSON
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_onAppForeground(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| t.app_foreground()).map(Some);
    string_result(&mut env, result)
}

/// JNI: Periodic service tick; returns an event batch JSON
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_tick(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| t.tick()).map(Some);
    string_result(&mut env, result)
}

/// JNI: Snapshot of an interrupted session, null when there is none
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_getPendingRecoveryJson(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let result = with_tracker(handle, |t| t.pending_recovery_json());
    string_result(&mut env, result)
}

/// JNI: Resolve an interrupted session ("resume", "finalize" or "discard")
/// Returns: finalized session JSON for "finalize", null otherwise
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_recoverSession(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    choice: JString,
) -> jstring {
    let result =
        require_string(&mut env, &choice, "choice").and_then(|choice| with_tracker(handle, |t| t.recover(&choice)));
    string_result(&mut env, result)
}

/// JNI: Background task delivery. Safe to call from a process where `init`
/// never ran.
/// Parameters: files dir, config JSON (nullable), JSON array of samples
/// Returns: accepted fix count, -1 on error (throws Java exception)
#[no_mangle]
pub extern "C" fn Java_com_example_workouttracker_JniBinding_onBackgroundLocations(
    mut env: JNIEnv,
    _class: JClass,
    files_dir: JString,
    config_json: JString,
    samples_json: JString,
) -> jint {
    init_logging();
    let result = background_impl(&mut env, &files_dir, &config_json, &samples_json);
    int_result(&mut env, result)
}

fn background_impl(
    env: &mut JNIEnv,
    files_dir: &JString,
    config_json: &JString,
    samples_json: &JString,
) -> JResult<jint> {
    let dir = PathBuf::from(require_string(env, files_dir, "filesDir")?);
    let config = parse_config(read_string(env, config_json)?.as_deref())?;
    let samples = read_string(env, samples_json)?.unwrap_or_else(|| "[]".to_string());
    let accepted = handle_background_locations(&dir, &config, &samples)?;
    Ok(jint::try_from(accepted).unwrap_or(jint::MAX))
}
