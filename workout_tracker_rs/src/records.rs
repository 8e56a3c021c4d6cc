//! Versioned records exchanged through the key-value store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::BackgroundConfig;
use crate::error::TrackResult;
use crate::storage::{load_json, save_json, KeyValueStore};
use crate::types::{ActivityKind, LocationSample, TrackingSession};

pub const SCHEMA_VERSION: u32 = 1;

fn current_schema() -> u32 {
    SCHEMA_VERSION
}

pub trait Versioned {
    fn schema_version(&self) -> u32;
}

/// Load a record, discarding anything written by a newer schema.
pub fn load_record<T>(store: &dyn KeyValueStore, key: &str) -> TrackResult<Option<T>>
where
    T: DeserializeOwned + Versioned,
{
    match load_json::<T>(store, key)? {
        Some(record) if record.schema_version() > SCHEMA_VERSION => {
            log::warn!(
                "discarding '{}' record with schema {} (reader understands {})",
                key,
                record.schema_version(),
                SCHEMA_VERSION
            );
            store.remove(key)?;
            Ok(None)
        }
        other => Ok(other),
    }
}

pub fn save_record<T: Serialize>(store: &dyn KeyValueStore, key: &str, record: &T) -> TrackResult<()> {
    save_json(store, key, record)
}

/// Foreground-owned description of the live session, read by the bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStateRecord {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    pub session_id: String,
    pub activity_kind: ActivityKind,
    pub paused: bool,
    pub start_time_ms: i64,
    /// Last time the foreground processed a fix; `None` once backgrounded
    #[serde(default)]
    pub foreground_heartbeat_ms: Option<i64>,
    /// Controller distance at the last handoff to the background
    #[serde(default)]
    pub handoff_distance_m: f64,
    /// Bumped on every foreground -> background handoff
    #[serde(default)]
    pub epoch: u64,
}

impl SessionStateRecord {
    pub fn new(session_id: &str, activity_kind: ActivityKind, start_time_ms: i64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: session_id.to_string(),
            activity_kind,
            paused: false,
            start_time_ms,
            foreground_heartbeat_ms: Some(start_time_ms),
            handoff_distance_m: 0.0,
            epoch: 0,
        }
    }

    /// Whether the foreground still owns accrual at `now_ms`.
    pub fn foreground_active(&self, now_ms: i64, stale_secs: f64) -> bool {
        match self.foreground_heartbeat_ms {
            Some(beat) => ((now_ms - beat) as f64 / 1000.0) < stale_secs,
            None => false,
        }
    }
}

impl Versioned for SessionStateRecord {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Written only by the background bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundAccumulatorState {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    pub session_id: String,
    pub cumulative_distance_m: f64,
    #[serde(default)]
    pub last_accepted_point: Option<LocationSample>,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default)]
    pub last_updated_ms: i64,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub warmup_remaining: u32,
}

impl BackgroundAccumulatorState {
    pub fn fresh(session_id: &str, epoch: u64, starting_distance_m: f64, warmup: u32) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: session_id.to_string(),
            cumulative_distance_m: starting_distance_m.max(0.0),
            last_accepted_point: None,
            sample_count: 0,
            last_updated_ms: 0,
            epoch,
            warmup_remaining: warmup,
        }
    }
}

impl Versioned for BackgroundAccumulatorState {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub session_id: String,
    pub batch_id: u64,
    pub samples: Vec<LocationSample>,
}

/// Bounded FIFO of background batches awaiting reconciliation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleBuffer {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    #[serde(default)]
    pub next_batch_id: u64,
    #[serde(default)]
    pub batches: Vec<SampleBatch>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_batch_id: 0,
            batches: Vec::new(),
        }
    }

    pub fn total_samples(&self) -> usize {
        self.batches.iter().map(|b| b.samples.len()).sum()
    }

    /// Append a batch, evicting the oldest until within both limits.
    /// Returns the number of evicted batches.
    pub fn push(&mut self, session_id: &str, samples: Vec<LocationSample>, limits: &BackgroundConfig) -> usize {
        if samples.is_empty() {
            return 0;
        }
        self.batches.push(SampleBatch {
            session_id: session_id.to_string(),
            batch_id: self.next_batch_id,
            samples,
        });
        self.next_batch_id += 1;

        let mut evicted = 0;
        while self.batches.len() > 1
            && (self.batches.len() > limits.max_buffered_batches
                || self.total_samples() > limits.max_buffered_samples)
        {
            self.batches.remove(0);
            evicted += 1;
        }
        evicted
    }

    /// Samples belonging to `session_id`, sorted by timestamp. Other sessions'
    /// batches are ignored.
    pub fn samples_for(&self, session_id: &str) -> Vec<LocationSample> {
        let mut samples: Vec<LocationSample> = self
            .batches
            .iter()
            .filter(|b| b.session_id == session_id)
            .flat_map(|b| b.samples.iter().cloned())
            .collect();
        samples.sort_by_key(|s| s.timestamp_ms);
        samples
    }
}

impl Versioned for SampleBuffer {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPhase {
    Tracking,
    Paused,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecoveryRecord {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    pub session: TrackingSession,
    pub phase: RecoveryPhase,
    #[serde(default)]
    pub pause_started_ms: Option<i64>,
    /// Timestamp the current active segment is measured from
    #[serde(default)]
    pub active_anchor_ms: Option<i64>,
    pub saved_at_ms: i64,
}

impl Versioned for SessionRecoveryRecord {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Id of the last session that stopped cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoppedMarker {
    #[serde(default = "current_schema")]
    pub schema_version: u32,
    pub session_id: String,
    pub stopped_at_ms: i64,
}

impl Versioned for StoppedMarker {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SESSION_STATE_KEY};

    fn sample(ts: i64) -> LocationSample {
        LocationSample::new(1.0, 2.0, ts)
    }

    #[test]
    fn test_newer_schema_is_discarded() {
        let store = MemoryStore::new();
        let mut record = SessionStateRecord::new("s1", ActivityKind::Running, 0);
        record.schema_version = SCHEMA_VERSION + 1;
        save_record(&store, SESSION_STATE_KEY, &record).unwrap();
        let loaded: Option<SessionStateRecord> = load_record(&store, SESSION_STATE_KEY).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{"session_id":"s","activity_kind":"walking","paused":false,"start_time_ms":5}"#;
        let record: SessionStateRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert_eq!(record.epoch, 0);
        assert!(record.foreground_heartbeat_ms.is_none());
    }

    #[test]
    fn test_heartbeat_freshness() {
        let mut record = SessionStateRecord::new("s", ActivityKind::Running, 1_000);
        assert!(record.foreground_active(20_000, 30.0));
        assert!(!record.foreground_active(40_000, 30.0));
        record.foreground_heartbeat_ms = None;
        assert!(!record.foreground_active(1_000, 30.0));
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let limits = BackgroundConfig {
            max_buffered_batches: 2,
            ..BackgroundConfig::default()
        };
        let mut buffer = SampleBuffer::new();
        buffer.push("s", vec![sample(1)], &limits);
        buffer.push("s", vec![sample(2)], &limits);
        let evicted = buffer.push("s", vec![sample(3)], &limits);
        assert_eq!(evicted, 1);
        assert_eq!(buffer.batches.len(), 2);
        assert_eq!(buffer.batches[0].batch_id, 1);
    }

    #[test]
    fn test_buffer_sample_cap() {
        let limits = BackgroundConfig {
            max_buffered_samples: 3,
            ..BackgroundConfig::default()
        };
        let mut buffer = SampleBuffer::new();
        buffer.push("s", vec![sample(1), sample(2)], &limits);
        buffer.push("s", vec![sample(3), sample(4)], &limits);
        assert_eq!(buffer.total_samples(), 2);
    }

    #[test]
    fn test_samples_for_filters_and_sorts() {
        let limits = BackgroundConfig::default();
        let mut buffer = SampleBuffer::new();
        buffer.push("s", vec![sample(30), sample(10)], &limits);
        buffer.push("other", vec![sample(20)], &limits);
        buffer.push("s", vec![sample(5)], &limits);
        let ts: Vec<i64> = buffer.samples_for("s").iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(ts, vec![5, 10, 30]);
    }
}
