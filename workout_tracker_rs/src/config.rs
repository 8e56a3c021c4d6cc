use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::TrackResult;

// ─── Sample validation ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_accuracy_m: f64,
    /// Relaxed accuracy gate during GPS warm-up
    pub warmup_max_accuracy_m: f64,
    pub warmup_window_secs: f64,
    pub min_time_delta_secs: f64,
    pub max_speed_mps: f64,
    pub jitter_floor_m: f64,
    pub max_jump_m: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 35.0,
            warmup_max_accuracy_m: 50.0,
            warmup_window_secs: 30.0,
            min_time_delta_secs: 0.5,
            max_speed_mps: 18.0,
            jitter_floor_m: 1.0,
            max_jump_m: 75.0,
        }
    }
}

// ─── Kalman position filter ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Position process noise (m²/s) at rest
    pub process_noise: f64,
    /// Extra process noise per unit of speed fraction
    pub speed_noise_factor: f64,
    /// Process noise multiplier for implausible accelerations
    pub unreasonable_noise_factor: f64,
    pub max_acceleration_mps2: f64,
    /// Consecutive implausible samples before adopting the new speed
    pub unreasonable_streak_limit: u32,
    pub min_accuracy_m: f64,
    /// Used when a fix carries no accuracy
    pub default_accuracy_m: f64,
    /// Measurement noise growth per unit of speed fraction
    pub measurement_speed_factor: f64,
    /// Accuracy below which a fix counts as clean
    pub good_accuracy_m: f64,
    pub base_max_gain: f64,
    pub min_max_gain: f64,
    pub gain_speed_weight: f64,
    pub speed_measurement_noise: f64,
    pub speed_process_noise: f64,
    pub warm_start: bool,
    pub warm_start_variance: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: 16.0,
            speed_noise_factor: 2.0,
            unreasonable_noise_factor: 4.0,
            max_acceleration_mps2: 2.5,
            unreasonable_streak_limit: 3,
            min_accuracy_m: 1.0,
            default_accuracy_m: 15.0,
            measurement_speed_factor: 0.5,
            good_accuracy_m: 10.0,
            base_max_gain: 0.95,
            min_max_gain: 0.35,
            gain_speed_weight: 0.25,
            speed_measurement_noise: 1.0,
            speed_process_noise: 0.5,
            warm_start: false,
            warm_start_variance: 4.0,
        }
    }
}

// ─── Accumulator / splits ────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    pub min_movement_m: f64,
    pub elevation_noise_floor_m: f64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            min_movement_m: 0.5,
            elevation_noise_floor_m: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub split_distance_m: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self { split_distance_m: 1000.0 }
    }
}

// ─── Background bridge / reconciliation ─────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Fixes dropped after a fresh background registration
    pub warmup_samples: u32,
    pub max_buffered_batches: usize,
    pub max_buffered_samples: usize,
    /// Foreground heartbeat older than this no longer owns accrual
    pub foreground_stale_secs: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            warmup_samples: 3,
            max_buffered_batches: 50,
            max_buffered_samples: 2000,
            foreground_stale_secs: 30.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 5.0 }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs.max(0.1))
    }
}

// ─── Recovery / signal / freeze ──────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub snapshot_interval_secs: f64,
    pub keep_samples_in_snapshot: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 5.0,
            keep_samples_in_snapshot: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub searching_after_secs: f64,
    pub lost_after_secs: f64,
    pub strong_accuracy_m: f64,
    pub medium_accuracy_m: f64,
    /// Consecutive speed/jump rejections treated as a discontinuity
    pub max_consecutive_rejections: u32,
    pub recovery_good_samples: u32,
    pub recovery_good_accuracy_m: f64,
    pub recovery_timeout_secs: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            searching_after_secs: 10.0,
            lost_after_secs: 15.0,
            strong_accuracy_m: 10.0,
            medium_accuracy_m: 20.0,
            max_consecutive_rejections: 5,
            recovery_good_samples: 3,
            recovery_good_accuracy_m: 20.0,
            recovery_timeout_secs: 30.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeConfig {
    pub stalled_samples: u32,
    pub min_raw_movement_m: f64,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            stalled_samples: 8,
            min_raw_movement_m: 25.0,
        }
    }
}

// ─── Platform provider ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub permission_timeout_secs: f64,
    pub background_min_distance_m: f64,
    pub background_min_interval_secs: f64,
    pub foreground_channel_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            permission_timeout_secs: 10.0,
            background_min_distance_m: 5.0,
            background_min_interval_secs: 2.0,
            foreground_channel_capacity: 256,
        }
    }
}

impl ProviderConfig {
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.permission_timeout_secs.max(0.0))
    }
}

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub validator: ValidatorConfig,
    pub kalman: KalmanConfig,
    pub accumulator: AccumulatorConfig,
    pub splits: SplitConfig,
    pub background: BackgroundConfig,
    pub reconcile: ReconcileConfig,
    pub recovery: RecoveryConfig,
    pub signal: SignalConfig,
    pub freeze: FreezeConfig,
    pub provider: ProviderConfig,
    /// Keep accepted fixes on the session for route reconstruction
    pub record_samples: bool,
}

impl TrackerConfig {
    /// Partial JSON overrides the defaults field by field.
    pub fn from_json_str(json: &str) -> TrackResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> TrackResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn default_recording() -> Self {
        Self {
            record_samples: true,
            ..Self::default()
        }
    }
}
