//! Crash recovery snapshots.

use serde::{Deserialize, Serialize};

use crate::config::RecoveryConfig;
use crate::error::TrackResult;
use crate::records::{load_record, save_record, SessionRecoveryRecord, StoppedMarker, SCHEMA_VERSION};
use crate::storage::{KeyValueStore, RECOVERY_SNAPSHOT_KEY, STOPPED_MARKER_KEY};
use crate::types::TrackingSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryChoice {
    /// Continue tracking from the snapshot
    Resume,
    /// Close the snapshot as a completed session
    Finalize,
    Discard,
}

impl std::str::FromStr for RecoveryChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resume" => Ok(RecoveryChoice::Resume),
            "finalize" => Ok(RecoveryChoice::Finalize),
            "discard" => Ok(RecoveryChoice::Discard),
            other => Err(format!("unknown recovery choice '{}'", other)),
        }
    }
}

/// Snapshot left behind by a session that never stopped cleanly.
pub fn pending_recovery(store: &dyn KeyValueStore) -> TrackResult<Option<SessionRecoveryRecord>> {
    let Some(snapshot) = load_record::<SessionRecoveryRecord>(store, RECOVERY_SNAPSHOT_KEY)? else {
        return Ok(None);
    };
    let marker: Option<StoppedMarker> = load_record(store, STOPPED_MARKER_KEY)?;
    if marker.is_some_and(|m| m.session_id == snapshot.session.id) {
        log::info!("removing snapshot of cleanly stopped session {}", snapshot.session.id);
        store.remove(RECOVERY_SNAPSHOT_KEY)?;
        return Ok(None);
    }
    Ok(Some(snapshot))
}

/// Turn a snapshot into a completed session ending at its last save.
pub fn finalize_snapshot(record: &SessionRecoveryRecord) -> TrackingSession {
    let mut session = record.session.clone();
    session.end_time_ms = Some(record.saved_at_ms.max(session.start_time_ms));
    session
}

pub fn clear_snapshot(store: &dyn KeyValueStore) -> TrackResult<()> {
    store.remove(RECOVERY_SNAPSHOT_KEY)
}

pub fn write_stopped_marker(store: &dyn KeyValueStore, session_id: &str, stopped_at_ms: i64) -> TrackResult<()> {
    let marker = StoppedMarker {
        schema_version: SCHEMA_VERSION,
        session_id: session_id.to_string(),
        stopped_at_ms,
    };
    save_record(store, STOPPED_MARKER_KEY, &marker)
}

/// Throttles snapshot writes and remembers whether recovery is still possible.
#[derive(Clone, Debug)]
pub struct SnapshotSchedule {
    interval_ms: i64,
    keep_samples: bool,
    last_saved_ms: Option<i64>,
    available: bool,
}

impl SnapshotSchedule {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            interval_ms: (config.snapshot_interval_secs * 1000.0) as i64,
            keep_samples: config.keep_samples_in_snapshot,
            last_saved_ms: None,
            available: true,
        }
    }

    pub fn reset(&mut self) {
        self.last_saved_ms = None;
        self.available = true;
    }

    pub fn due(&self, now_ms: i64) -> bool {
        self.last_saved_ms.map_or(true, |t| now_ms - t >= self.interval_ms)
    }

    pub fn keep_samples(&self) -> bool {
        self.keep_samples
    }

    pub fn mark_saved(&mut self, now_ms: i64) {
        self.last_saved_ms = Some(now_ms);
        self.available = true;
    }

    pub fn mark_failed(&mut self) {
        self.available = false;
    }

    pub fn is_available(&self) -> bool {
        self.available
    }
}
