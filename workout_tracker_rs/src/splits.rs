//! Per-kilometre split detection.
//!
//! Splits are emitted when cumulative distance crosses a multiple of the split
//! size. A single update that crosses several milestones (a merged background
//! distance, say) emits one split per milestone with durations interpolated
//! between the previous and current update.

use crate::config::SplitConfig;
use crate::types::{ActivityKind, Split};

#[derive(Clone, Debug)]
pub struct SplitTracker {
    split_distance_m: f64,
    enabled: bool,
    last_split_distance_m: f64,
    last_distance_m: f64,
    last_duration_s: f64,
    splits: Vec<Split>,
}

impl SplitTracker {
    pub fn new(config: &SplitConfig, activity: ActivityKind) -> Self {
        Self {
            split_distance_m: config.split_distance_m.max(1.0),
            enabled: activity.emits_splits(),
            last_split_distance_m: 0.0,
            last_distance_m: 0.0,
            last_duration_s: 0.0,
            splits: Vec::new(),
        }
    }

    pub fn reset(&mut self, activity: ActivityKind) {
        self.enabled = activity.emits_splits();
        self.last_split_distance_m = 0.0;
        self.last_distance_m = 0.0;
        self.last_duration_s = 0.0;
        self.splits.clear();
    }

    /// Resume from previously emitted splits and the current totals.
    pub fn restore(&mut self, splits: &[Split], distance_m: f64, duration_s: f64) {
        self.splits = splits.to_vec();
        self.last_split_distance_m = self
            .splits
            .last()
            .map(|s| s.cumulative_distance_m)
            .unwrap_or(0.0);
        self.last_distance_m = distance_m;
        self.last_duration_s = duration_s;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    /// Check for crossed milestones; returns the newly completed splits.
    pub fn update(&mut self, distance_m: f64, duration_s: f64) -> Vec<Split> {
        let mut completed = Vec::new();
        if !self.enabled || distance_m <= self.last_distance_m {
            self.last_duration_s = self.last_duration_s.max(duration_s);
            return completed;
        }

        let size = self.split_distance_m;
        let done = (self.last_split_distance_m / size).floor() as u32;
        let reached = (distance_m / size).floor() as u32;

        for milestone in (done + 1)..=reached {
            let milestone_m = milestone as f64 * size;
            let span = distance_m - self.last_distance_m;
            let frac = ((milestone_m - self.last_distance_m) / span).clamp(0.0, 1.0);
            let at_s = self.last_duration_s + frac * (duration_s - self.last_duration_s).max(0.0);
            let previous_s = self
                .splits
                .last()
                .map(|s| s.cumulative_duration_s)
                .unwrap_or(0.0);
            let split = Split {
                index: milestone,
                cumulative_distance_m: milestone_m,
                cumulative_duration_s: at_s,
                split_pace_s: (at_s - previous_s).max(0.0),
            };
            log::info!(
                "split {} completed at {:.0} m, pace {:.0} s",
                split.index,
                split.cumulative_distance_m,
                split.split_pace_s
            );
            self.splits.push(split.clone());
            completed.push(split);
            self.last_split_distance_m = milestone_m;
        }

        self.last_distance_m = distance_m;
        self.last_duration_s = duration_s;
        completed
    }
}
