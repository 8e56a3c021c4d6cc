//! Physical-plausibility gate for raw location fixes.
//!
//! Shared by the foreground controller and the background bridge so both
//! contexts accept exactly the same samples.

use serde::{Deserialize, Serialize};

use crate::config::ValidatorConfig;
use crate::types::LocationSample;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Horizontal accuracy worse than the active threshold
    InaccurateFix,
    /// Duplicate, out-of-order or too close in time to the previous fix
    TooFrequent,
    /// Implied speed above the activity ceiling
    TooFast,
    /// Below the jitter floor (ignored, not an error)
    Jitter,
    /// Single-sample jump above the teleport ceiling
    Teleport,
}

impl RejectReason {
    /// Speed and jump rejections point at a discontinuity rather than noise.
    pub fn is_discontinuity(self) -> bool {
        matches!(self, RejectReason::TooFast | RejectReason::Teleport)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Validation {
    Accepted {
        /// Haversine distance from the previous accepted fix (0 for the first)
        distance_m: f64,
        speed_mps: f64,
        dt_secs: f64,
    },
    Rejected(RejectReason),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted { .. })
    }
}

#[derive(Clone, Debug, Default)]
pub struct SampleValidator {
    config: ValidatorConfig,
}

impl SampleValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Accuracy threshold in force at `timestamp_ms`.
    pub fn accuracy_threshold(&self, timestamp_ms: i64, session_start_ms: Option<i64>) -> f64 {
        match session_start_ms {
            Some(start) => {
                let since_start = (timestamp_ms - start) as f64 / 1000.0;
                if since_start < self.config.warmup_window_secs {
                    self.config.warmup_max_accuracy_m
                } else {
                    self.config.max_accuracy_m
                }
            }
            None => self.config.max_accuracy_m,
        }
    }

    pub fn validate(
        &self,
        sample: &LocationSample,
        previous: Option<&LocationSample>,
        session_start_ms: Option<i64>,
    ) -> Validation {
        if !sample.latitude.is_finite() || !sample.longitude.is_finite() {
            return Validation::Rejected(RejectReason::InaccurateFix);
        }

        // Accuracy gate (relaxed during warm-up)
        if let Some(accuracy) = sample.horizontal_accuracy {
            let threshold = self.accuracy_threshold(sample.timestamp_ms, session_start_ms);
            if !accuracy.is_finite() || accuracy > threshold {
                return Validation::Rejected(RejectReason::InaccurateFix);
            }
        }

        let previous = match previous {
            Some(p) => p,
            None => {
                return Validation::Accepted {
                    distance_m: 0.0,
                    speed_mps: 0.0,
                    dt_secs: 0.0,
                }
            }
        };

        let dt_secs = (sample.timestamp_ms - previous.timestamp_ms) as f64 / 1000.0;
        if dt_secs < self.config.min_time_delta_secs {
            return Validation::Rejected(RejectReason::TooFrequent);
        }

        let distance_m = previous.coordinate().distance_to(&sample.coordinate());
        let speed_mps = distance_m / dt_secs;
        if speed_mps > self.config.max_speed_mps {
            return Validation::Rejected(RejectReason::TooFast);
        }
        if distance_m < self.config.jitter_floor_m {
            return Validation::Rejected(RejectReason::Jitter);
        }
        if distance_m > self.config.max_jump_m {
            return Validation::Rejected(RejectReason::Teleport);
        }

        Validation::Accepted {
            distance_m,
            speed_mps,
            dt_secs,
        }
    }
}
