//! Cumulative distance and elevation over filtered points.

use serde::{Deserialize, Serialize};

use crate::config::{AccumulatorConfig, FreezeConfig};
use crate::types::{Coordinate, FilteredPoint};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorSnapshot {
    pub total_distance_m: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
}

#[derive(Clone, Debug)]
pub struct DistanceAccumulator {
    config: AccumulatorConfig,
    total_distance_m: f64,
    elevation_gain_m: f64,
    elevation_loss_m: f64,
    last_point: Option<Coordinate>,
    last_altitude: Option<f64>,
}

impl DistanceAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        Self {
            config,
            total_distance_m: 0.0,
            elevation_gain_m: 0.0,
            elevation_loss_m: 0.0,
            last_point: None,
            last_altitude: None,
        }
    }

    /// Zero everything for a new session.
    pub fn reset(&mut self) {
        self.total_distance_m = 0.0;
        self.elevation_gain_m = 0.0;
        self.elevation_loss_m = 0.0;
        self.reset_reference();
    }

    /// Forget the reference point; the next point only re-anchors.
    pub fn reset_reference(&mut self) {
        self.last_point = None;
        self.last_altitude = None;
    }

    /// Restore totals from a snapshot (recovery).
    pub fn restore(&mut self, snapshot: &AccumulatorSnapshot) {
        self.total_distance_m = snapshot.total_distance_m.max(0.0);
        self.elevation_gain_m = snapshot.elevation_gain_m.max(0.0);
        self.elevation_loss_m = snapshot.elevation_loss_m.max(0.0);
        self.reset_reference();
    }

    pub fn snapshot(&self) -> AccumulatorSnapshot {
        AccumulatorSnapshot {
            total_distance_m: self.total_distance_m,
            elevation_gain_m: self.elevation_gain_m,
            elevation_loss_m: self.elevation_loss_m,
        }
    }

    /// Feed one filtered point; returns the distance added (possibly 0).
    pub fn add(&mut self, point: &FilteredPoint, altitude: Option<f64>) -> f64 {
        self.track_elevation(altitude);

        let current = point.coordinate();
        let previous = match self.last_point {
            Some(p) => p,
            None => {
                self.last_point = Some(current);
                return 0.0;
            }
        };

        let step = previous.distance_to(&current);
        if !step.is_finite() || step < self.config.min_movement_m {
            // Keep the old reference so slow motion still adds up
            return 0.0;
        }
        self.total_distance_m += step;
        self.last_point = Some(current);
        step
    }

    fn track_elevation(&mut self, altitude: Option<f64>) {
        let Some(altitude) = altitude.filter(|a| a.is_finite()) else {
            return;
        };
        let Some(reference) = self.last_altitude else {
            self.last_altitude = Some(altitude);
            return;
        };
        let delta = altitude - reference;
        if delta.abs() < self.config.elevation_noise_floor_m {
            return;
        }
        if delta > 0.0 {
            self.elevation_gain_m += delta;
        } else {
            self.elevation_loss_m -= delta;
        }
        self.last_altitude = Some(altitude);
    }

    /// Raise the total to `distance_m` if larger. Never lowers it.
    pub fn adopt_distance(&mut self, distance_m: f64) -> bool {
        if distance_m.is_finite() && distance_m > self.total_distance_m {
            self.total_distance_m = distance_m;
            true
        } else {
            false
        }
    }

    pub fn total(&self) -> f64 {
        self.total_distance_m
    }

    pub fn elevation_gain(&self) -> f64 {
        self.elevation_gain_m
    }

    pub fn elevation_loss(&self) -> f64 {
        self.elevation_loss_m
    }

    pub fn has_reference(&self) -> bool {
        self.last_point.is_some()
    }
}

impl Default for DistanceAccumulator {
    fn default() -> Self {
        Self::new(AccumulatorConfig::default())
    }
}

/// Flags an accumulator that stopped growing while fixes keep moving.
#[derive(Clone, Debug)]
pub struct StallDetector {
    config: FreezeConfig,
    stalled_samples: u32,
    raw_movement_m: f64,
}

impl StallDetector {
    pub fn new(config: FreezeConfig) -> Self {
        Self {
            config,
            stalled_samples: 0,
            raw_movement_m: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.stalled_samples = 0;
        self.raw_movement_m = 0.0;
    }

    /// Record one accepted fix. Returns true when a freeze is detected.
    pub fn observe(&mut self, added_m: f64, raw_m: f64) -> bool {
        if added_m > 0.0 {
            self.reset();
            return false;
        }
        self.stalled_samples += 1;
        self.raw_movement_m += raw_m.max(0.0);
        if self.stalled_samples >= self.config.stalled_samples
            && self.raw_movement_m >= self.config.min_raw_movement_m
        {
            log::warn!(
                "distance frozen for {} fixes despite {:.0} m of raw movement",
                self.stalled_samples,
                self.raw_movement_m
            );
            self.reset();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point(c: Coordinate) -> FilteredPoint {
        FilteredPoint {
            latitude: c.latitude,
            longitude: c.longitude,
            accuracy: 5.0,
        }
    }

    fn origin() -> Coordinate {
        Coordinate::new(47.6062, -122.3321)
    }

    #[test]
    fn test_first_point_only_anchors() {
        let mut acc = DistanceAccumulator::default();
        assert_eq!(acc.add(&point(origin()), None), 0.0);
        assert!(acc.has_reference());
        assert_eq!(acc.total(), 0.0);
    }

    #[test]
    fn test_slow_motion_still_accumulates() {
        let mut acc = DistanceAccumulator::default();
        acc.add(&point(origin()), None);
        // 0.3 m steps are each below the floor
        for i in 1..=10 {
            acc.add(&point(origin().destination(0.0, i as f64 * 0.3)), None);
        }
        assert_relative_eq!(acc.total(), 3.0, epsilon = 0.5);
    }

    #[test]
    fn test_adopt_distance_is_monotonic() {
        let mut acc = DistanceAccumulator::default();
        assert!(acc.adopt_distance(120.0));
        assert!(!acc.adopt_distance(80.0));
        assert!(!acc.adopt_distance(f64::NAN));
        assert_eq!(acc.total(), 120.0);
    }

    #[test]
    fn test_elevation_noise_floor() {
        let mut acc = DistanceAccumulator::default();
        acc.add(&point(origin()), Some(100.0));
        acc.add(&point(origin()), Some(100.6));
        acc.add(&point(origin()), Some(101.2));
        acc.add(&point(origin()), Some(99.0));
        assert_relative_eq!(acc.elevation_gain(), 1.2, epsilon = 1e-9);
        assert_relative_eq!(acc.elevation_loss(), 2.2, epsilon = 1e-9);
    }

    #[test]
    fn test_stall_detector_needs_raw_movement() {
        let mut stall = StallDetector::new(FreezeConfig::default());
        // Standing still: many empty fixes, little raw movement
        for _ in 0..20 {
            assert!(!stall.observe(0.0, 1.0));
        }
        let mut stall = StallDetector::new(FreezeConfig::default());
        for _ in 0..7 {
            assert!(!stall.observe(0.0, 5.0));
        }
        assert!(stall.observe(0.0, 5.0));
        // Counter starts over after a trigger
        assert!(!stall.observe(0.0, 5.0));
    }

    #[test]
    fn test_stall_detector_resets_on_progress() {
        let mut stall = StallDetector::new(FreezeConfig::default());
        for _ in 0..7 {
            stall.observe(0.0, 5.0);
        }
        assert!(!stall.observe(2.0, 5.0));
        assert!(!stall.observe(0.0, 5.0));
    }

    #[test]
    fn test_reset_reference_keeps_totals() {
        let mut acc = DistanceAccumulator::default();
        acc.add(&point(origin()), None);
        acc.add(&point(origin().destination(0.0, 10.0)), None);
        acc.reset_reference();
        // A far jump after re-anchoring adds nothing
        acc.add(&point(origin().destination(0.0, 500.0)), None);
        assert_relative_eq!(acc.total(), 10.0, epsilon = 1e-6);
    }
}
