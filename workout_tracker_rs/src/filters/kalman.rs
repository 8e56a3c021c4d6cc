//! Position Kalman Filter (per-axis, speed adaptive)
//!
//! State: filtered (lat, lng), scalar position variance [m²], plus a
//! separately smoothed speed used to bound corrections.
//!
//! Each axis is filtered independently in a local (north, east) frame centred
//! on the current estimate. Process noise grows with speed and with implausible
//! accelerations; the gain is capped so a single noisy fix cannot snap the
//! estimate, and the correction is bounded by what the body could physically
//! have travelled since the last fix.

use serde::{Deserialize, Serialize};

use crate::config::KalmanConfig;
use crate::types::{clamp_axes, ActivityKind, Coordinate, FilteredPoint, LocationSample};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KalmanState {
    pub latitude: f64,
    pub longitude: f64,
    /// Position variance [m²]
    pub position_variance: f64,
    pub last_timestamp_ms: i64,
    pub last_speed: f64,
    pub speed_variance: f64,
    pub update_count: u64,
}

pub struct KalmanPositionFilter {
    config: KalmanConfig,
    activity: ActivityKind,
    state: Option<KalmanState>,
    /// Previous raw fix, for measured speed
    last_raw: Option<Coordinate>,
    unreasonable_streak: u32,
}

impl KalmanPositionFilter {
    pub fn new(config: KalmanConfig, activity: ActivityKind) -> Self {
        Self {
            config,
            activity,
            state: None,
            last_raw: None,
            unreasonable_streak: 0,
        }
    }

    /// Clear all state. Must run at the start of every session.
    pub fn reset(&mut self) {
        self.state = None;
        self.last_raw = None;
        self.unreasonable_streak = 0;
    }

    /// Reset and retarget to a different activity kind.
    pub fn reset_for(&mut self, activity: ActivityKind) {
        self.activity = activity;
        self.reset();
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&KalmanState> {
        self.state.as_ref()
    }

    fn measurement_accuracy(&self, sample: &LocationSample) -> f64 {
        sample
            .horizontal_accuracy
            .filter(|a| a.is_finite() && *a > 0.0)
            .unwrap_or(self.config.default_accuracy_m)
            .max(self.config.min_accuracy_m)
    }

    pub fn update(&mut self, sample: &LocationSample) -> FilteredPoint {
        let accuracy = self.measurement_accuracy(sample);
        let measured = sample.coordinate();

        let state = match self.state.as_mut() {
            Some(state) => state,
            None => {
                // First fix: take it as-is, seed variance from accuracy
                let (variance, speed) = if self.config.warm_start {
                    (self.config.warm_start_variance, self.activity.warm_start_speed_mps())
                } else {
                    (accuracy * accuracy, 0.0)
                };
                self.state = Some(KalmanState {
                    latitude: measured.latitude,
                    longitude: measured.longitude,
                    position_variance: variance,
                    last_timestamp_ms: sample.timestamp_ms,
                    last_speed: speed,
                    speed_variance: 1.0,
                    update_count: 1,
                });
                self.last_raw = Some(measured);
                self.unreasonable_streak = 0;
                return FilteredPoint {
                    latitude: measured.latitude,
                    longitude: measured.longitude,
                    accuracy: variance.sqrt(),
                };
            }
        };

        let dt = (sample.timestamp_ms - state.last_timestamp_ms).max(1) as f64 / 1000.0;
        let raw_distance = self
            .last_raw
            .map(|prev| prev.distance_to(&measured))
            .unwrap_or(0.0);
        let current_speed = sample
            .reported_speed
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(raw_distance / dt);

        // Acceleration plausibility
        let acceleration = (current_speed - state.last_speed).abs() / dt;
        let reasonable = acceleration <= self.config.max_acceleration_mps2;
        let mut adopt_speed = false;
        if reasonable {
            self.unreasonable_streak = 0;
        } else {
            self.unreasonable_streak += 1;
            adopt_speed = self.unreasonable_streak >= self.config.unreasonable_streak_limit;
        }

        // Predict: variance grows with speed and implausibility
        let speed_fraction = (current_speed / self.activity.reference_speed_mps()).clamp(0.0, 1.0);
        let mut q = self.config.process_noise * (1.0 + speed_fraction * self.config.speed_noise_factor);
        if !reasonable {
            q *= self.config.unreasonable_noise_factor;
        }
        state.position_variance += q * dt;

        if reasonable {
            let speed_gain =
                state.speed_variance / (state.speed_variance + self.config.speed_measurement_noise);
            state.last_speed += speed_gain * (current_speed - state.last_speed);
            state.speed_variance =
                (1.0 - speed_gain) * state.speed_variance + self.config.speed_process_noise * dt;
        } else if adopt_speed {
            // Sustained "implausible" speed is a new regime, not noise
            state.last_speed = current_speed;
            state.speed_variance = 1.0;
            self.unreasonable_streak = 0;
        }

        // Update
        let measurement_noise =
            accuracy * accuracy * (1.0 + self.config.measurement_speed_factor * speed_fraction);
        let noise_level = (accuracy - self.config.good_accuracy_m).max(0.0) / self.config.good_accuracy_m
            + speed_fraction * self.config.gain_speed_weight;
        let max_gain = (self.config.base_max_gain / (1.0 + noise_level)).max(self.config.min_max_gain);
        let gain = (state.position_variance / (state.position_variance + measurement_noise)).min(max_gain);

        let max_displacement = state.last_speed * dt
            + 0.5 * self.config.max_acceleration_mps2 * dt * dt
            + accuracy;
        let estimate = Coordinate::new(state.latitude, state.longitude);
        let innovation = clamp_axes(&estimate.offset_to(&measured), max_displacement);
        let corrected = estimate.shifted(&(innovation * gain));

        state.latitude = corrected.latitude;
        state.longitude = corrected.longitude;
        state.position_variance *= 1.0 - gain;
        state.last_timestamp_ms = sample.timestamp_ms;
        state.update_count += 1;
        self.last_raw = Some(measured);

        FilteredPoint {
            latitude: state.latitude,
            longitude: state.longitude,
            accuracy: state.position_variance.sqrt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Coordinate {
        Coordinate::new(37.7749, -122.4194)
    }

    fn fix(c: Coordinate, ts: i64, acc: f64) -> LocationSample {
        LocationSample::new(c.latitude, c.longitude, ts).with_accuracy(acc)
    }

    #[test]
    fn test_first_update_passes_through() {
        let mut kf = KalmanPositionFilter::new(KalmanConfig::default(), ActivityKind::Running);
        let p = kf.update(&fix(origin(), 0, 5.0));
        assert_eq!(p.latitude, origin().latitude);
        assert_eq!(p.longitude, origin().longitude);
        assert!((p.accuracy - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_noisy_outlier_does_not_snap() {
        let mut kf = KalmanPositionFilter::new(KalmanConfig::default(), ActivityKind::Running);
        for i in 0..10 {
            kf.update(&fix(origin(), i * 1000, 5.0));
        }
        // 30 m outlier with poor accuracy
        let outlier = origin().destination(90.0, 30.0);
        let p = kf.update(&fix(outlier, 10_000, 30.0));
        let moved = origin().distance_to(&p.coordinate());
        assert!(moved < 30.0 * 0.5, "moved {}", moved);
    }

    #[test]
    fn test_tracks_steady_motion() {
        let mut kf = KalmanPositionFilter::new(KalmanConfig::default(), ActivityKind::Running);
        let mut last = None;
        for i in 0..60 {
            let truth = origin().destination(0.0, i as f64 * 3.0);
            last = Some((truth, kf.update(&fix(truth, i * 1000, 5.0))));
        }
        let (truth, estimate) = last.unwrap();
        assert!(truth.distance_to(&estimate.coordinate()) < 5.0);
    }

    #[test]
    fn test_variance_shrinks_with_good_fixes() {
        let mut kf = KalmanPositionFilter::new(KalmanConfig::default(), ActivityKind::Walking);
        let first = kf.update(&fix(origin(), 0, 20.0));
        let mut p = first;
        for i in 1..5 {
            p = kf.update(&fix(origin(), i * 1000, 5.0));
        }
        assert!(p.accuracy < first.accuracy);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut kf = KalmanPositionFilter::new(KalmanConfig::default(), ActivityKind::Running);
        kf.update(&fix(origin(), 0, 5.0));
        kf.update(&fix(origin().destination(0.0, 3.0), 1000, 5.0));
        assert!(kf.is_initialized());
        kf.reset();
        assert!(!kf.is_initialized());
        // Next fix re-initialises without smoothing toward the old estimate
        let far = origin().destination(0.0, 500.0);
        let p = kf.update(&fix(far, 2000, 5.0));
        assert!(far.distance_to(&p.coordinate()) < 1e-6);
    }

    #[test]
    fn test_warm_start_seeds_speed() {
        let config = KalmanConfig {
            warm_start: true,
            ..KalmanConfig::default()
        };
        let mut kf = KalmanPositionFilter::new(config, ActivityKind::Running);
        let p = kf.update(&fix(origin(), 0, 10.0));
        assert!((p.accuracy - 2.0).abs() < 1e-9);
        assert_eq!(kf.state().unwrap().last_speed, ActivityKind::Running.warm_start_speed_mps());
    }

    #[test]
    fn test_unreasonable_acceleration_holds_speed_until_streak() {
        let mut kf = KalmanPositionFilter::new(KalmanConfig::default(), ActivityKind::Cycling);
        kf.update(&fix(origin(), 0, 5.0));
        // 10 m/s from rest is 10 m/s², implausible
        kf.update(&fix(origin().destination(0.0, 10.0), 1000, 5.0));
        assert_eq!(kf.state().unwrap().last_speed, 0.0);
        kf.update(&fix(origin().destination(0.0, 20.0), 2000, 5.0));
        kf.update(&fix(origin().destination(0.0, 30.0), 3000, 5.0));
        // Third consecutive implausible sample adopts the regime
        assert!(kf.state().unwrap().last_speed > 9.0);
    }
}
