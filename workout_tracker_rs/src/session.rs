//! Session controller: lifecycle, per-fix pipeline and handoff bookkeeping.
//!
//! The controller is a plain owned value. Hosts that need the periodic
//! reconciliation task share it as `Arc<Mutex<SessionController>>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::accumulator::{AccumulatorSnapshot, DistanceAccumulator, StallDetector};
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::{TrackResult, TrackingError};
use crate::filters::KalmanPositionFilter;
use crate::provider::{BackgroundTaskOptions, LocationProvider, PermissionStatus};
use crate::reconcile::ReconciliationSync;
use crate::records::{
    load_record, save_record, BackgroundAccumulatorState, RecoveryPhase, SessionRecoveryRecord,
    SessionStateRecord, SCHEMA_VERSION,
};
use crate::recovery::{self, RecoveryChoice, SnapshotSchedule};
use crate::signal::{SignalMonitor, SignalTransition};
use crate::splits::SplitTracker;
use crate::storage::{
    KeyValueStore, BACKGROUND_STATE_KEY, RECOVERY_SNAPSHOT_KEY, SAMPLE_BUFFER_KEY, SESSION_STATE_KEY,
};
use crate::types::{ActivityKind, LocationSample, SignalStrength, Split, TrackingSession};
use crate::validator::{RejectReason, SampleValidator, Validation};

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

fn new_session_id(now_ms: i64) -> String {
    format!("session_{}_{}", now_ms, SESSION_SEQ.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerState {
    Idle,
    Tracking,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackingEvent {
    SampleRejected(RejectReason),
    DistanceUpdated { total_m: f64, added_m: f64 },
    SplitCompleted(Split),
    SignalLost,
    SignalRestored,
    RecoveryTimeout,
    /// Repeated impossible jumps; the reference was dropped
    Discontinuity,
    DistanceFreezeDetected,
    /// Persistence failed; the session continues in memory
    StorageFailure(String),
    BackgroundMerged { distance_m: f64, samples: usize },
}

pub struct SessionController {
    config: TrackerConfig,
    provider: Box<dyn LocationProvider>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,

    validator: SampleValidator,
    kalman: KalmanPositionFilter,
    accumulator: DistanceAccumulator,
    splits: SplitTracker,
    signal: SignalMonitor,
    stall: StallDetector,
    sync: ReconciliationSync,
    snapshots: SnapshotSchedule,

    state: TrackerState,
    session: Option<TrackingSession>,
    foreground: Option<Receiver<LocationSample>>,
    last_accepted: Option<LocationSample>,
    /// Newest fix timestamp folded into the session, foreground or background
    last_sample_ms: Option<i64>,
    /// Start of the open active segment; `None` while paused
    active_anchor_ms: Option<i64>,
    pause_started_ms: Option<i64>,
    backgrounded: bool,
    epoch: u64,
    last_reconcile_ms: Option<i64>,
    pending_events: Vec<TrackingEvent>,
}

impl SessionController {
    pub fn new(
        config: TrackerConfig,
        provider: Box<dyn LocationProvider>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let kind = ActivityKind::Running;
        Self {
            validator: SampleValidator::new(config.validator.clone()),
            kalman: KalmanPositionFilter::new(config.kalman.clone(), kind),
            accumulator: DistanceAccumulator::new(config.accumulator.clone()),
            splits: SplitTracker::new(&config.splits, kind),
            signal: SignalMonitor::new(config.signal.clone()),
            stall: StallDetector::new(config.freeze.clone()),
            sync: ReconciliationSync::new(store.clone()),
            snapshots: SnapshotSchedule::new(&config.recovery),
            config,
            provider,
            store,
            clock,
            state: TrackerState::Idle,
            session: None,
            foreground: None,
            last_accepted: None,
            last_sample_ms: None,
            active_anchor_ms: None,
            pause_started_ms: None,
            backgrounded: false,
            epoch: 0,
            last_reconcile_ms: None,
            pending_events: Vec::new(),
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != TrackerState::Idle
    }

    pub fn current_session(&self) -> Option<TrackingSession> {
        self.session.clone()
    }

    pub fn signal_strength(&self) -> SignalStrength {
        if self.state == TrackerState::Idle {
            return SignalStrength::None;
        }
        self.signal.strength(self.clock.now_ms())
    }

    pub fn can_start(&self) -> bool {
        self.state == TrackerState::Idle
    }

    pub fn can_pause(&self) -> bool {
        self.state == TrackerState::Tracking
    }

    pub fn can_resume(&self) -> bool {
        self.state == TrackerState::Paused
    }

    pub fn can_stop(&self) -> bool {
        self.state != TrackerState::Idle
    }

    /// False once a persistence failure made crash recovery unreliable.
    pub fn recovery_available(&self) -> bool {
        self.snapshots.is_available()
    }

    pub fn is_backgrounded(&self) -> bool {
        self.backgrounded
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    fn ensure_permission(&mut self) -> TrackResult<()> {
        if self.provider.permission_status() == PermissionStatus::Granted {
            return Ok(());
        }
        let timeout = self.config.provider.permission_timeout();
        let answer = self.provider.request_permission()?;
        match answer.recv_timeout(timeout) {
            Ok(true) => Ok(()),
            Ok(false) | Err(RecvTimeoutError::Disconnected) => Err(TrackingError::PermissionDenied),
            Err(RecvTimeoutError::Timeout) => Err(TrackingError::PermissionTimeout(timeout)),
        }
    }

    fn reset_pipeline(&mut self, kind: ActivityKind, now_ms: i64) {
        self.kalman.reset_for(kind);
        self.accumulator.reset();
        self.splits.reset(kind);
        self.signal.start(now_ms);
        self.stall.reset();
        self.snapshots.reset();
        self.last_accepted = None;
        self.last_sample_ms = None;
        self.pause_started_ms = None;
        self.backgrounded = false;
        self.last_reconcile_ms = Some(now_ms);
        self.pending_events.clear();
    }

    /// Subscribe, keep the device awake and register the background task.
    /// Returns false if only the foreground could be set up.
    fn connect_provider(&mut self, session_id: &str, kind: ActivityKind) -> TrackResult<bool> {
        if let Err(e) = self.provider.acquire_wake_lock() {
            log::warn!("keep-awake lock unavailable: {}", e);
        }
        match self.provider.subscribe(self.config.provider.foreground_channel_capacity) {
            Ok(rx) => self.foreground = Some(rx),
            Err(e) => {
                self.provider.release_wake_lock();
                return Err(e);
            }
        }
        let options = BackgroundTaskOptions {
            session_id: session_id.to_string(),
            activity_kind: kind,
            min_distance_m: self.config.provider.background_min_distance_m,
            min_interval_secs: self.config.provider.background_min_interval_secs,
        };
        match self.provider.register_background(&options) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("background task registration failed, foreground only: {}", e);
                Ok(false)
            }
        }
    }

    /// Start a new session. `Ok(false)` means tracking runs without the
    /// background task.
    pub fn start_tracking(&mut self, kind: ActivityKind) -> TrackResult<bool> {
        if self.state != TrackerState::Idle {
            return Err(TrackingError::AlreadyTracking);
        }
        self.ensure_permission()?;

        let now = self.clock.now_ms();
        self.reset_pipeline(kind, now);
        self.epoch = 0;
        let session = TrackingSession::new(new_session_id(now), kind, now);
        let session_id = session.id.clone();

        let background_ok = self.connect_provider(&session_id, kind)?;

        // Leftovers from a previous session must never merge into this one
        for key in [BACKGROUND_STATE_KEY, SAMPLE_BUFFER_KEY, RECOVERY_SNAPSHOT_KEY] {
            let result = self.store.remove(key);
            self.note_storage(result, "clearing stale state");
        }

        self.session = Some(session);
        self.active_anchor_ms = Some(now);
        self.state = TrackerState::Tracking;
        self.persist(true);

        log::info!("started {} session {}", kind.as_str(), session_id);
        Ok(background_ok)
    }

    pub fn pause_tracking(&mut self) -> TrackResult<()> {
        match self.state {
            TrackerState::Tracking => {}
            TrackerState::Paused => return Err(TrackingError::InvalidState("already paused".to_string())),
            TrackerState::Idle => return Err(TrackingError::NotTracking),
        }
        let now = self.clock.now_ms();
        self.close_active_segment(now);
        self.pause_started_ms = Some(now);
        self.state = TrackerState::Paused;
        self.persist(true);
        log::info!("session paused");
        Ok(())
    }

    pub fn resume_tracking(&mut self) -> TrackResult<()> {
        match self.state {
            TrackerState::Paused => {}
            TrackerState::Tracking => return Err(TrackingError::InvalidState("not paused".to_string())),
            TrackerState::Idle => return Err(TrackingError::NotTracking),
        }
        let now = self.clock.now_ms();
        if let Some(session) = self.session.as_mut() {
            let started = self.pause_started_ms.take().unwrap_or(now);
            session.paused_duration_s += (now - started).max(0) as f64 / 1000.0;
            session.pause_count += 1;
        }
        self.reanchor();
        self.signal.rearm(now);
        self.active_anchor_ms = Some(now);
        self.state = TrackerState::Tracking;
        // The bridge still holds its pre-pause reference; a new epoch drops it
        self.epoch += 1;
        self.persist(true);
        log::info!("session resumed (epoch {})", self.epoch);
        Ok(())
    }

    /// Finish the session. Every cleanup step runs even if an earlier one fails.
    pub fn stop_tracking(&mut self) -> TrackResult<TrackingSession> {
        if self.state == TrackerState::Idle {
            return Err(TrackingError::NotTracking);
        }
        // Fixes already delivered still count
        if self.state == TrackerState::Tracking && !self.backgrounded {
            self.pump_foreground();
        }

        let now = self.clock.now_ms();
        match self.state {
            TrackerState::Tracking => self.close_active_segment(now),
            TrackerState::Paused => {
                if let (Some(session), Some(started)) = (self.session.as_mut(), self.pause_started_ms.take()) {
                    session.paused_duration_s += (now - started).max(0) as f64 / 1000.0;
                }
            }
            TrackerState::Idle => {}
        }

        self.provider.unsubscribe();
        self.foreground = None;
        if let Err(e) = self.provider.unregister_background() {
            log::warn!("background task deregistration failed: {}", e);
        }
        // Exactly one final merge, after the background can no longer write
        if let Err(e) = self.reconcile_now() {
            log::warn!("final reconciliation failed: {}", e);
        }
        self.provider.release_wake_lock();

        let mut session = match self.session.take() {
            Some(session) => session,
            None => return Err(TrackingError::InvalidState("no session to stop".to_string())),
        };
        session.end_time_ms = Some(now);

        for key in [SESSION_STATE_KEY, BACKGROUND_STATE_KEY, SAMPLE_BUFFER_KEY, RECOVERY_SNAPSHOT_KEY] {
            if let Err(e) = self.store.remove(key) {
                log::warn!("failed to clear '{}': {}", key, e);
            }
        }
        if let Err(e) = recovery::write_stopped_marker(&*self.store, &session.id, now) {
            log::warn!("failed to write stopped marker: {}", e);
        }

        self.state = TrackerState::Idle;
        self.signal.stop();
        self.active_anchor_ms = None;
        self.backgrounded = false;
        self.last_accepted = None;
        self.pending_events.clear();

        log::info!(
            "stopped session {}: {:.1} m in {:.0} s active, {} splits",
            session.id,
            session.cumulative_distance_m,
            session.active_duration_s,
            session.splits.len()
        );
        Ok(session)
    }

    // ─── App lifecycle ───────────────────────────────────────────────────────

    /// Hand accrual over to the background task.
    pub fn on_app_background(&mut self) -> Vec<TrackingEvent> {
        if self.state == TrackerState::Idle || self.backgrounded {
            return Vec::new();
        }
        let mut events = self.pump_foreground();
        self.provider.unsubscribe();
        self.foreground = None;
        self.backgrounded = true;
        self.epoch += 1;
        self.persist(true);
        log::info!(
            "backgrounded at {:.1} m (epoch {})",
            self.accumulator.total(),
            self.epoch
        );
        events.append(&mut self.pending_events);
        events
    }

    /// Take accrual back from the background task.
    pub fn on_app_foreground(&mut self) -> Vec<TrackingEvent> {
        if self.state == TrackerState::Idle {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.backgrounded = false;
        match self.reconcile_now() {
            Ok(mut merged) => events.append(&mut merged),
            Err(e) => log::warn!("reconciliation on foreground failed: {}", e),
        }
        match self.provider.subscribe(self.config.provider.foreground_channel_capacity) {
            Ok(rx) => self.foreground = Some(rx),
            Err(e) => log::warn!("foreground resubscribe failed: {}", e),
        }
        self.reanchor();
        self.signal.rearm(self.clock.now_ms());
        self.persist(true);
        events.append(&mut self.pending_events);
        events
    }

    // ─── Per-fix pipeline ────────────────────────────────────────────────────

    /// Drain every fix waiting on the foreground subscription.
    pub fn pump_foreground(&mut self) -> Vec<TrackingEvent> {
        let samples: Vec<LocationSample> = match self.foreground.as_ref() {
            Some(rx) => rx.try_iter().collect(),
            None => return Vec::new(),
        };
        let mut events = Vec::new();
        for sample in samples {
            events.extend(self.handle_location(sample));
        }
        events
    }

    pub fn handle_location(&mut self, sample: LocationSample) -> Vec<TrackingEvent> {
        let mut events = Vec::new();
        let Some(start_ms) = self.session.as_ref().map(|s| s.start_time_ms) else {
            return events;
        };
        self.signal.record_fix(sample.timestamp_ms, sample.horizontal_accuracy);

        if self.state == TrackerState::Paused {
            let verdict = self.validator.validate(&sample, self.last_accepted.as_ref(), Some(start_ms));
            log::debug!("fix while paused ({:?}), not accumulated", verdict);
            return events;
        }

        self.advance_active(sample.timestamp_ms);

        let verdict = self.validator.validate(&sample, self.last_accepted.as_ref(), Some(start_ms));
        let raw_distance_m = match verdict {
            Validation::Accepted { distance_m, .. } => distance_m,
            Validation::Rejected(reason) => {
                log::debug!("fix rejected: {:?}", reason);
                events.push(TrackingEvent::SampleRejected(reason));
                if let Some(SignalTransition::Discontinuity) =
                    self.signal.record_rejection(reason, sample.timestamp_ms)
                {
                    self.reanchor();
                    events.push(TrackingEvent::Discontinuity);
                }
                events.append(&mut self.pending_events);
                return events;
            }
        };

        self.signal.record_accepted();
        self.last_accepted = Some(sample.clone());
        self.last_sample_ms = Some(self.last_sample_ms.map_or(sample.timestamp_ms, |t| t.max(sample.timestamp_ms)));
        if self.config.record_samples {
            if let Some(session) = self.session.as_mut() {
                session.samples.push(sample.clone());
            }
        }

        if self.signal.in_recovery() {
            match self.signal.recovery_fix(sample.horizontal_accuracy, sample.timestamp_ms) {
                Some(SignalTransition::Restored) => events.push(TrackingEvent::SignalRestored),
                Some(SignalTransition::RecoveryTimeout) => events.push(TrackingEvent::RecoveryTimeout),
                _ => {
                    // Still recovering: follow the fix without accruing
                    self.reanchor_filters();
                    self.persist(false);
                    events.append(&mut self.pending_events);
                    return events;
                }
            }
            self.reanchor_filters();
        }

        let filtered = self.kalman.update(&sample);
        let mut added_m = self.accumulator.add(&filtered, sample.altitude);

        if self.stall.observe(added_m, raw_distance_m) {
            events.push(TrackingEvent::DistanceFreezeDetected);
            self.reanchor_filters();
            let filtered = self.kalman.update(&sample);
            added_m = self.accumulator.add(&filtered, sample.altitude);
        }

        events.extend(self.sync_totals(added_m));
        self.persist(false);
        events.append(&mut self.pending_events);
        events
    }

    /// Copy accumulator totals into the session and check splits.
    fn sync_totals(&mut self, added_m: f64) -> Vec<TrackingEvent> {
        let mut events = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return events;
        };
        session.cumulative_distance_m = self.accumulator.total();
        session.elevation_gain_m = self.accumulator.elevation_gain();
        session.elevation_loss_m = self.accumulator.elevation_loss();
        if added_m > 0.0 {
            events.push(TrackingEvent::DistanceUpdated {
                total_m: session.cumulative_distance_m,
                added_m,
            });
        }
        for split in self.splits.update(session.cumulative_distance_m, session.active_duration_s) {
            session.splits.push(split.clone());
            events.push(TrackingEvent::SplitCompleted(split));
        }
        events
    }

    /// Drop the validator reference and restart the filter chain.
    fn reanchor(&mut self) {
        self.last_accepted = None;
        self.reanchor_filters();
    }

    fn reanchor_filters(&mut self) {
        self.kalman.reset();
        self.accumulator.reset_reference();
        self.stall.reset();
    }

    /// Extend the open active segment to `timestamp_ms`. Without an anchor
    /// (fresh after crash recovery) the fix only opens the segment.
    fn advance_active(&mut self, timestamp_ms: i64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match self.active_anchor_ms {
            Some(anchor) if timestamp_ms > anchor => {
                session.active_duration_s += (timestamp_ms - anchor) as f64 / 1000.0;
                self.active_anchor_ms = Some(timestamp_ms);
            }
            Some(_) => {}
            None if self.state == TrackerState::Tracking => self.active_anchor_ms = Some(timestamp_ms),
            None => {}
        }
    }

    fn close_active_segment(&mut self, now_ms: i64) {
        self.advance_active(now_ms);
        self.active_anchor_ms = None;
    }

    // ─── Periodic work ───────────────────────────────────────────────────────

    /// Drain the subscription, check signal loss and run a due reconciliation.
    pub fn tick(&mut self) -> Vec<TrackingEvent> {
        if self.state == TrackerState::Idle {
            return Vec::new();
        }
        let mut events = self.pump_foreground();
        let now = self.clock.now_ms();

        if self.state == TrackerState::Tracking && !self.backgrounded {
            match self.signal.check(now) {
                Some(SignalTransition::Lost) => {
                    log::warn!("GPS signal lost");
                    self.reanchor();
                    events.push(TrackingEvent::SignalLost);
                }
                Some(SignalTransition::RecoveryTimeout) => {
                    self.reanchor();
                    events.push(TrackingEvent::RecoveryTimeout);
                }
                _ => {}
            }
        }

        let interval_ms = self.config.reconcile.interval().as_millis() as i64;
        if self.last_reconcile_ms.map_or(true, |t| now - t >= interval_ms) {
            match self.reconcile_now() {
                Ok(mut merged) => events.append(&mut merged),
                Err(e) => {
                    log::warn!("periodic reconciliation failed: {}", e);
                    events.push(TrackingEvent::StorageFailure(e.to_string()));
                }
            }
        }

        self.persist(false);
        events.append(&mut self.pending_events);
        events
    }

    /// Merge the background accumulator and drain its sample buffer.
    pub fn reconcile_now(&mut self) -> TrackResult<Vec<TrackingEvent>> {
        let mut events = Vec::new();
        let Some((session_id, current)) = self
            .session
            .as_ref()
            .map(|s| (s.id.clone(), s.cumulative_distance_m))
        else {
            return Ok(events);
        };
        self.last_reconcile_ms = Some(self.clock.now_ms());

        let merged = self.sync.reconcile(&session_id, current, self.last_sample_ms)?;
        let adopted = merged
            .adopted_distance_m
            .map(|d| self.accumulator.adopt_distance(d))
            .unwrap_or(false);

        if let (Some(oldest), Some(newest)) = (
            merged.samples.first().map(|s| s.timestamp_ms),
            merged.samples.last().map(|s| s.timestamp_ms),
        ) {
            self.last_sample_ms = Some(self.last_sample_ms.map_or(newest, |t| t.max(newest)));
            if self.state == TrackerState::Tracking {
                self.advance_active(oldest);
                self.advance_active(newest);
            }
            if let Some(session) = self.session.as_mut() {
                if self.config.record_samples {
                    session.samples.extend(merged.samples.iter().cloned());
                }
            }
        }

        if adopted || !merged.samples.is_empty() {
            events.push(TrackingEvent::BackgroundMerged {
                distance_m: self.accumulator.total(),
                samples: merged.samples.len(),
            });
        }
        events.extend(self.sync_totals(0.0));
        Ok(events)
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    fn note_storage(&mut self, result: TrackResult<()>, what: &str) {
        if let Err(e) = result {
            log::warn!("{} failed, continuing in memory: {}", what, e);
            if self.snapshots.is_available() {
                self.pending_events.push(TrackingEvent::StorageFailure(e.to_string()));
            }
            self.snapshots.mark_failed();
        }
    }

    fn session_state_record(&self, now_ms: i64) -> Option<SessionStateRecord> {
        let session = self.session.as_ref()?;
        Some(SessionStateRecord {
            schema_version: SCHEMA_VERSION,
            session_id: session.id.clone(),
            activity_kind: session.activity_kind,
            paused: self.state == TrackerState::Paused,
            start_time_ms: session.start_time_ms,
            foreground_heartbeat_ms: if self.backgrounded { None } else { Some(now_ms) },
            handoff_distance_m: self.accumulator.total(),
            epoch: self.epoch,
        })
    }

    fn recovery_record(&self, now_ms: i64) -> Option<SessionRecoveryRecord> {
        let mut session = self.session.clone()?;
        if !self.snapshots.keep_samples() {
            session.samples.clear();
        }
        Some(SessionRecoveryRecord {
            schema_version: SCHEMA_VERSION,
            session,
            phase: if self.state == TrackerState::Paused {
                RecoveryPhase::Paused
            } else {
                RecoveryPhase::Tracking
            },
            pause_started_ms: self.pause_started_ms,
            active_anchor_ms: self.active_anchor_ms,
            saved_at_ms: now_ms,
        })
    }

    /// Write the session state (heartbeat) and the recovery snapshot, either
    /// now or when the snapshot interval has elapsed.
    fn persist(&mut self, force: bool) {
        let now = self.clock.now_ms();
        if !force && !self.snapshots.due(now) {
            return;
        }
        let (Some(state), Some(snapshot)) = (self.session_state_record(now), self.recovery_record(now)) else {
            return;
        };
        let result = save_record(&*self.store, SESSION_STATE_KEY, &state)
            .and_then(|_| save_record(&*self.store, RECOVERY_SNAPSHOT_KEY, &snapshot));
        match result {
            Ok(()) => self.snapshots.mark_saved(now),
            Err(e) => self.note_storage(Err(e), "persisting session"),
        }
    }

    // ─── Recovery ────────────────────────────────────────────────────────────

    pub fn pending_recovery(&self) -> TrackResult<Option<SessionRecoveryRecord>> {
        recovery::pending_recovery(&*self.store)
    }

    /// Act on an interrupted session. `Finalize` returns the closed session.
    pub fn recover(&mut self, choice: RecoveryChoice) -> TrackResult<Option<TrackingSession>> {
        if self.state != TrackerState::Idle {
            return Err(TrackingError::AlreadyTracking);
        }
        let record = self.pending_recovery()?.ok_or(TrackingError::NoRecoverySnapshot)?;

        match choice {
            RecoveryChoice::Discard => {
                log::info!("discarding interrupted session {}", record.session.id);
                self.clear_session_keys()?;
                Ok(None)
            }
            RecoveryChoice::Finalize => {
                let session = recovery::finalize_snapshot(&record);
                log::info!(
                    "finalizing interrupted session {} at {:.1} m",
                    session.id,
                    session.cumulative_distance_m
                );
                self.clear_session_keys()?;
                recovery::write_stopped_marker(&*self.store, &session.id, record.saved_at_ms)?;
                Ok(Some(session))
            }
            RecoveryChoice::Resume => {
                self.resume_from(record)?;
                Ok(None)
            }
        }
    }

    fn clear_session_keys(&self) -> TrackResult<()> {
        for key in [SESSION_STATE_KEY, BACKGROUND_STATE_KEY, SAMPLE_BUFFER_KEY] {
            self.store.remove(key)?;
        }
        recovery::clear_snapshot(&*self.store)
    }

    fn resume_from(&mut self, record: SessionRecoveryRecord) -> TrackResult<()> {
        self.ensure_permission()?;
        let now = self.clock.now_ms();
        let session = record.session;
        let kind = session.activity_kind;

        self.reset_pipeline(kind, now);
        self.accumulator.restore(&AccumulatorSnapshot {
            total_distance_m: session.cumulative_distance_m,
            elevation_gain_m: session.elevation_gain_m,
            elevation_loss_m: session.elevation_loss_m,
        });
        self.splits
            .restore(&session.splits, session.cumulative_distance_m, session.active_duration_s);
        self.last_sample_ms = session.last_sample_timestamp();

        // A new epoch makes the bridge re-anchor instead of trusting its old reference
        let old_state: Option<SessionStateRecord> = load_record(&*self.store, SESSION_STATE_KEY)?;
        let old_bg: Option<BackgroundAccumulatorState> = load_record(&*self.store, BACKGROUND_STATE_KEY)?;
        let last_epoch = old_state
            .filter(|s| s.session_id == session.id)
            .map(|s| s.epoch)
            .into_iter()
            .chain(old_bg.filter(|b| b.session_id == session.id).map(|b| b.epoch))
            .max()
            .unwrap_or(0);
        self.epoch = last_epoch + 1;

        self.connect_provider(&session.id, kind)?;
        match record.phase {
            RecoveryPhase::Tracking => {
                // Downtime is not active time; the next fix opens the segment
                self.state = TrackerState::Tracking;
                self.active_anchor_ms = None;
            }
            RecoveryPhase::Paused => {
                self.state = TrackerState::Paused;
                self.active_anchor_ms = None;
                self.pause_started_ms = Some(record.pause_started_ms.unwrap_or(record.saved_at_ms));
            }
        }
        log::info!(
            "resuming session {} at {:.1} m ({:?})",
            session.id,
            session.cumulative_distance_m,
            record.phase
        );
        self.session = Some(session);
        self.persist(true);
        // Pick up anything the background recorded while we were gone
        self.reconcile_now()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::SimulatedLocationProvider;
    use crate::storage::test_support::FlakyStore;
    use crate::storage::MemoryStore;
    use crate::types::Coordinate;

    struct Harness {
        controller: SessionController,
        provider: SimulatedLocationProvider,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let provider = SimulatedLocationProvider::granted();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let controller = SessionController::new(
            TrackerConfig::default_recording(),
            Box::new(provider.clone()),
            store.clone(),
            clock.clone(),
        );
        Harness {
            controller,
            provider,
            store,
            clock,
        }
    }

    fn origin() -> Coordinate {
        Coordinate::new(37.7749, -122.4194)
    }

    fn fix_at(metres: f64, ts: i64) -> LocationSample {
        let c = origin().destination(0.0, metres);
        LocationSample::new(c.latitude, c.longitude, ts).with_accuracy(5.0)
    }

    impl Harness {
        /// Feed `count` fixes 5 m / 1 s apart starting at `from_m`.
        fn run(&mut self, from_m: f64, count: usize) -> Vec<TrackingEvent> {
            let mut events = Vec::new();
            for i in 0..count {
                self.clock.advance_ms(1_000);
                let sample = fix_at(from_m + i as f64 * 5.0, self.clock.now_ms());
                events.extend(self.controller.handle_location(sample));
            }
            events
        }

        fn distance(&self) -> f64 {
            self.controller.current_session().map(|s| s.cumulative_distance_m).unwrap_or(0.0)
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut h = harness();
        assert!(h.controller.can_start());
        assert!(matches!(h.controller.pause_tracking(), Err(TrackingError::NotTracking)));
        assert!(h.controller.start_tracking(ActivityKind::Running).unwrap());
        assert!(matches!(
            h.controller.start_tracking(ActivityKind::Running),
            Err(TrackingError::AlreadyTracking)
        ));
        assert!(h.controller.can_pause() && h.controller.can_stop());
        assert!(h.controller.resume_tracking().is_err());
        h.controller.pause_tracking().unwrap();
        assert!(h.controller.can_resume());
        h.controller.resume_tracking().unwrap();
        h.controller.stop_tracking().unwrap();
        assert_eq!(h.controller.state(), TrackerState::Idle);
        assert!(matches!(h.controller.stop_tracking(), Err(TrackingError::NotTracking)));
    }

    #[test]
    fn test_start_wires_provider_and_store() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Walking).unwrap();
        assert!(h.provider.is_subscribed());
        assert!(h.provider.wake_lock_held());
        let options = h.provider.background_registration().unwrap();
        assert_eq!(options.activity_kind, ActivityKind::Walking);
        let record: SessionStateRecord = load_record(&*h.store, SESSION_STATE_KEY).unwrap().unwrap();
        assert_eq!(record.session_id, h.controller.current_session().unwrap().id);
        assert!(!record.paused);
    }

    #[test]
    fn test_permission_denied() {
        let mut h = harness();
        h.provider.set_permission(PermissionStatus::Undetermined, Some(false));
        assert!(matches!(
            h.controller.start_tracking(ActivityKind::Running),
            Err(TrackingError::PermissionDenied)
        ));
        assert!(h.controller.can_start());
        assert!(!h.provider.wake_lock_held());
    }

    #[test]
    fn test_permission_timeout() {
        let mut h = harness();
        h.controller.config.provider.permission_timeout_secs = 0.05;
        h.provider.set_permission(PermissionStatus::Undetermined, None);
        assert!(matches!(
            h.controller.start_tracking(ActivityKind::Running),
            Err(TrackingError::PermissionTimeout(_))
        ));
    }

    #[test]
    fn test_short_walk_distance() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        let events = h.run(0.0, 4);
        let d = h.distance();
        assert!((12.5..=15.5).contains(&d), "distance {}", d);
        assert!(!events.iter().any(|e| matches!(e, TrackingEvent::SplitCompleted(_))));
    }

    #[test]
    fn test_distance_is_monotonic() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        let mut last = 0.0;
        for i in 0..60 {
            h.clock.advance_ms(1_000);
            // Zig-zag with a little lateral noise
            let lateral = if i % 2 == 0 { 2.0 } else { -2.0 };
            let c = origin().destination(0.0, i as f64 * 4.0).destination(90.0, lateral);
            let sample = LocationSample::new(c.latitude, c.longitude, h.clock.now_ms()).with_accuracy(6.0);
            h.controller.handle_location(sample);
            let d = h.distance();
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn test_jump_rejected_and_distance_unchanged() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 5);
        let before = h.distance();
        h.clock.advance_ms(1_000);
        let events = h.controller.handle_location(fix_at(220.0, h.clock.now_ms()));
        assert!(events.iter().any(|e| matches!(e, TrackingEvent::SampleRejected(_))));
        assert_eq!(h.distance(), before);
    }

    #[test]
    fn test_pause_adds_no_distance() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 10);
        h.controller.pause_tracking().unwrap();
        let paused_at = h.distance();
        // Keep moving while paused
        h.run(50.0, 20);
        assert_eq!(h.distance(), paused_at);
        h.controller.resume_tracking().unwrap();
        // First fix after resume only re-anchors
        h.clock.advance_ms(1_000);
        h.controller.handle_location(fix_at(300.0, h.clock.now_ms()));
        assert_eq!(h.distance(), paused_at);
        let session = h.controller.current_session().unwrap();
        assert_eq!(session.pause_count, 1);
        assert!((session.paused_duration_s - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_active_duration_excludes_pause() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Walking).unwrap();
        h.run(0.0, 30);
        h.controller.pause_tracking().unwrap();
        h.clock.advance_ms(60_000);
        h.controller.resume_tracking().unwrap();
        h.run(200.0, 10);
        let session = h.controller.stop_tracking().unwrap();
        assert!((session.active_duration_s - 40.0).abs() < 1e-6);
        assert!((session.paused_duration_s - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_stop_cleans_up_even_on_failure() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.provider.set_fail_unregister(true);
        let session = h.controller.stop_tracking().unwrap();
        assert!(session.end_time_ms.is_some());
        assert!(!h.provider.wake_lock_held());
        assert!(!h.provider.is_subscribed());
        assert!(h.store.get(SESSION_STATE_KEY).unwrap().is_none());
        assert!(h.controller.pending_recovery().unwrap().is_none());
    }

    #[test]
    fn test_stop_adopts_larger_background_distance() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 20);
        let id = h.controller.current_session().unwrap().id;
        let mut bg = BackgroundAccumulatorState::fresh(&id, 1, 0.0, 0);
        bg.cumulative_distance_m = 1_200.0;
        save_record(&*h.store, BACKGROUND_STATE_KEY, &bg).unwrap();
        let session = h.controller.stop_tracking().unwrap();
        assert_eq!(session.cumulative_distance_m, 1_200.0);
        assert_eq!(session.splits.len(), 1);
    }

    #[test]
    fn test_foreign_background_state_ignored() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 5);
        let mut bg = BackgroundAccumulatorState::fresh("someone_else", 1, 0.0, 0);
        bg.cumulative_distance_m = 9_000.0;
        save_record(&*h.store, BACKGROUND_STATE_KEY, &bg).unwrap();
        h.controller.reconcile_now().unwrap();
        assert!(h.distance() < 100.0);
    }

    #[test]
    fn test_storage_failure_degrades() {
        let provider = SimulatedLocationProvider::granted();
        let store = Arc::new(FlakyStore::default());
        let clock = Arc::new(ManualClock::new(0));
        let mut controller =
            SessionController::new(TrackerConfig::default(), Box::new(provider), store.clone(), clock.clone());
        controller.start_tracking(ActivityKind::Running).unwrap();
        store.set_failing(true);
        let mut events = Vec::new();
        for i in 0..10 {
            clock.advance_ms(1_000);
            events.extend(controller.handle_location(fix_at(i as f64 * 5.0, clock.now_ms())));
        }
        let failures = events
            .iter()
            .filter(|e| matches!(e, TrackingEvent::StorageFailure(_)))
            .count();
        assert_eq!(failures, 1);
        assert!(!controller.recovery_available());
        assert!(controller.current_session().unwrap().cumulative_distance_m > 30.0);
        // Stop still succeeds
        assert!(controller.stop_tracking().is_ok());
    }

    #[test]
    fn test_signal_loss_and_restore() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 5);
        assert_eq!(h.controller.signal_strength(), SignalStrength::Strong);
        h.clock.advance_ms(16_000);
        let events = h.controller.tick();
        assert!(events.contains(&TrackingEvent::SignalLost));
        assert_eq!(h.controller.signal_strength(), SignalStrength::Searching);

        let before = h.distance();
        let events = h.run(400.0, 3);
        // Recovery fixes only re-anchor
        assert!(events.contains(&TrackingEvent::SignalRestored));
        assert_eq!(h.distance(), before);
        h.run(415.0, 5);
        assert!(h.distance() > before + 15.0);
    }

    #[test]
    fn test_recovery_timeout_resumes_accrual() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 3);
        h.clock.advance_ms(16_000);
        h.controller.tick();
        // Poor fixes keep recovery open until the timeout
        let mut saw_timeout = false;
        for i in 0..40 {
            h.clock.advance_ms(1_000);
            let c = origin().destination(0.0, 200.0 + i as f64 * 3.0);
            let sample = LocationSample::new(c.latitude, c.longitude, h.clock.now_ms()).with_accuracy(30.0);
            saw_timeout |= h.controller.handle_location(sample).contains(&TrackingEvent::RecoveryTimeout);
        }
        assert!(saw_timeout);
        assert!(h.distance() > 10.0);
    }

    #[test]
    fn test_repeated_jumps_reanchor() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 5);
        let mut events = Vec::new();
        for i in 0..5 {
            h.clock.advance_ms(1_000);
            events.extend(h.controller.handle_location(fix_at(500.0 + i as f64 * 3.0, h.clock.now_ms())));
        }
        assert!(events.contains(&TrackingEvent::Discontinuity));
    }

    #[test]
    fn test_cycling_has_no_splits() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Cycling).unwrap();
        for i in 0..150 {
            h.clock.advance_ms(1_000);
            h.controller.handle_location(fix_at(i as f64 * 10.0, h.clock.now_ms()));
        }
        let session = h.controller.stop_tracking().unwrap();
        assert!(session.cumulative_distance_m > 1_000.0);
        assert!(session.splits.is_empty());
    }

    #[test]
    fn test_background_handoff_writes_epoch() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 10);
        h.controller.on_app_background();
        assert!(!h.provider.is_subscribed());
        let record: SessionStateRecord = load_record(&*h.store, SESSION_STATE_KEY).unwrap().unwrap();
        assert_eq!(record.epoch, 1);
        assert!(record.foreground_heartbeat_ms.is_none());
        assert!((record.handoff_distance_m - h.distance()).abs() < 1e-9);
        h.controller.on_app_foreground();
        assert!(h.provider.is_subscribed());
    }

    #[test]
    fn test_pump_foreground_drains_channel() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        for i in 0..4 {
            h.clock.advance_ms(1_000);
            assert!(h.provider.emit(fix_at(i as f64 * 5.0, h.clock.now_ms())));
        }
        h.controller.pump_foreground();
        let d = h.distance();
        assert!((12.5..=15.5).contains(&d), "distance {}", d);
    }

    #[test]
    fn test_resume_from_snapshot_keeps_id() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 20);
        h.clock.advance_ms(10_000);
        h.controller.tick();
        let id = h.controller.current_session().unwrap().id;
        let distance = h.distance();

        // Simulated crash: a new controller on the same store
        let clock = h.clock.clone();
        let mut revived = SessionController::new(
            TrackerConfig::default_recording(),
            Box::new(h.provider.clone()),
            h.store.clone(),
            clock,
        );
        let pending = revived.pending_recovery().unwrap().unwrap();
        assert_eq!(pending.session.id, id);
        revived.recover(RecoveryChoice::Resume).unwrap();
        assert_eq!(revived.state(), TrackerState::Tracking);
        assert_eq!(revived.current_session().unwrap().id, id);
        assert!((revived.current_session().unwrap().cumulative_distance_m - distance).abs() < 1e-9);
    }

    #[test]
    fn test_crash_downtime_is_not_active_time() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.run(0.0, 60);
        let before = h.controller.current_session().unwrap().active_duration_s;
        assert!((before - 60.0).abs() < 1e-6);

        // Process dead for ten minutes
        h.clock.advance_ms(600_000);
        let mut revived = SessionController::new(
            TrackerConfig::default_recording(),
            Box::new(h.provider.clone()),
            h.store.clone(),
            h.clock.clone(),
        );
        revived.recover(RecoveryChoice::Resume).unwrap();
        for i in 0..11 {
            h.clock.advance_ms(1_000);
            revived.handle_location(fix_at(400.0 + i as f64 * 5.0, h.clock.now_ms()));
        }
        let session = revived.current_session().unwrap();
        assert!((session.active_duration_s - 70.0).abs() < 1e-6, "active {}", session.active_duration_s);
    }

    #[test]
    fn test_resume_bumps_handoff_epoch() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Running).unwrap();
        h.controller.pause_tracking().unwrap();
        h.controller.resume_tracking().unwrap();
        let record: SessionStateRecord = load_record(&*h.store, SESSION_STATE_KEY).unwrap().unwrap();
        assert_eq!(record.epoch, 1);
        assert!(!record.paused);
    }

    #[test]
    fn test_finalize_and_discard() {
        let mut h = harness();
        h.controller.start_tracking(ActivityKind::Walking).unwrap();
        h.run(0.0, 10);
        let mut other = SessionController::new(
            TrackerConfig::default(),
            Box::new(h.provider.clone()),
            h.store.clone(),
            h.clock.clone(),
        );
        let finalized = other.recover(RecoveryChoice::Finalize).unwrap().unwrap();
        assert!(finalized.end_time_ms.is_some());
        assert!(other.pending_recovery().unwrap().is_none());
        assert!(matches!(
            other.recover(RecoveryChoice::Discard),
            Err(TrackingError::NoRecoverySnapshot)
        ));
    }
}
