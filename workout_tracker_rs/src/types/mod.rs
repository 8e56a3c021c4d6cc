pub mod geodesy;
pub mod linalg;

pub use geodesy::*;
pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Raw fix from the OS location provider. Timestamps are device clock milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub horizontal_accuracy: Option<f64>,
    #[serde(default)]
    pub reported_speed: Option<f64>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            timestamp_ms,
            horizontal_accuracy: None,
            reported_speed: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.horizontal_accuracy = Some(accuracy);
        self
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.reported_speed = Some(speed);
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Kalman filter output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilteredPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

impl FilteredPoint {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Running,
    Walking,
    Cycling,
}

impl ActivityKind {
    /// Pace per split only means something on foot.
    pub fn emits_splits(self) -> bool {
        matches!(self, ActivityKind::Running | ActivityKind::Walking)
    }

    /// Speed treated as "fast" when scaling Kalman noise (m/s).
    pub fn reference_speed_mps(self) -> f64 {
        match self {
            ActivityKind::Running => 7.0,
            ActivityKind::Walking => 2.5,
            ActivityKind::Cycling => 15.0,
        }
    }

    /// Seed speed for a warm-started filter (m/s).
    pub fn warm_start_speed_mps(self) -> f64 {
        match self {
            ActivityKind::Running => 2.8,
            ActivityKind::Walking => 1.4,
            ActivityKind::Cycling => 5.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Running => "running",
            ActivityKind::Walking => "walking",
            ActivityKind::Cycling => "cycling",
        }
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" | "run" => Ok(ActivityKind::Running),
            "walking" | "walk" => Ok(ActivityKind::Walking),
            "cycling" | "ride" | "bike" => Ok(ActivityKind::Cycling),
            other => Err(format!("unknown activity kind '{}'", other)),
        }
    }
}

/// Completed distance milestone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    /// 1-based
    pub index: u32,
    pub cumulative_distance_m: f64,
    pub cumulative_duration_s: f64,
    pub split_pace_s: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingSession {
    pub id: String,
    pub activity_kind: ActivityKind,
    pub start_time_ms: i64,
    #[serde(default)]
    pub end_time_ms: Option<i64>,
    pub cumulative_distance_m: f64,
    pub active_duration_s: f64,
    pub paused_duration_s: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub pause_count: u32,
    #[serde(default)]
    pub splits: Vec<Split>,
    #[serde(default)]
    pub samples: Vec<LocationSample>,
}

impl TrackingSession {
    pub fn new(id: String, activity_kind: ActivityKind, start_time_ms: i64) -> Self {
        Self {
            id,
            activity_kind,
            start_time_ms,
            end_time_ms: None,
            cumulative_distance_m: 0.0,
            active_duration_s: 0.0,
            paused_duration_s: 0.0,
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            pause_count: 0,
            splits: Vec::new(),
            samples: Vec::new(),
        }
    }

    /// Average pace in seconds per kilometre, if any distance was covered.
    pub fn average_pace_s_per_km(&self) -> Option<f64> {
        if self.cumulative_distance_m < 1.0 {
            return None;
        }
        Some(self.active_duration_s / (self.cumulative_distance_m / 1000.0))
    }

    pub fn last_sample_timestamp(&self) -> Option<i64> {
        self.samples.last().map(|s| s.timestamp_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStrength {
    None,
    Searching,
    Weak,
    Medium,
    Strong,
}

impl SignalStrength {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalStrength::None => "none",
            SignalStrength::Searching => "searching",
            SignalStrength::Weak => "weak",
            SignalStrength::Medium => "medium",
            SignalStrength::Strong => "strong",
        }
    }
}
